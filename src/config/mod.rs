//! Конфигурация мультиплексора: значения по умолчанию и переменные
//! окружения `BUSMUX_*` через крейт `config`.

pub mod settings;

pub use settings::*;
