use std::time::Duration;

use rand::Rng;

/// Политика задержек между попытками подключения к шине.
///
/// Для попытки `n` задержка выбирается равномерно из
/// `[0, min(ceiling, base * 2^n)]`. Счётчик попыток перестаёт расти после
/// `attempt_cap`, поэтому потолок достигается и удерживается, а сами
/// повторы не прекращаются до явного закрытия мультиплексора.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempt_cap: u32,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Backoff {
    /// Базовая задержка по умолчанию.
    pub const DEFAULT_BASE: Duration = Duration::from_millis(8);
    /// Потолок задержки по умолчанию.
    pub const DEFAULT_CEILING: Duration = Duration::from_millis(512);

    /// Создаёт политику. Предел счётчика попыток вычисляется как наименьшее
    /// `n`, при котором `base * 2^n` достигает потолка.
    pub fn new(
        base: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            base,
            ceiling,
            attempt_cap: attempts_to_ceiling(base, ceiling),
        }
    }

    /// Явно задаёт предел счётчика попыток.
    pub fn with_attempt_cap(
        mut self,
        attempt_cap: u32,
    ) -> Self {
        self.attempt_cap = attempt_cap;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn attempt_cap(&self) -> u32 {
        self.attempt_cap
    }

    /// Верхняя граница задержки для попытки `attempt`.
    pub fn max_delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let exponent = attempt.min(self.attempt_cap).min(63);
        let base_ms = self.base.as_millis() as u64;
        let ceiling_ms = self.ceiling.as_millis() as u64;
        let grown = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(grown.min(ceiling_ms))
    }

    /// Случайная задержка для попытки `attempt`.
    pub fn delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let upper = self.max_delay(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=upper))
    }

    /// Номер следующей попытки: растёт на единицу, но не выше предела.
    pub fn next_attempt(
        &self,
        attempt: u32,
    ) -> u32 {
        attempt.saturating_add(1).min(self.attempt_cap.max(1))
    }
}

fn attempts_to_ceiling(
    base: Duration,
    ceiling: Duration,
) -> u32 {
    let base_ms = base.as_millis() as u64;
    let ceiling_ms = ceiling.as_millis() as u64;
    if base_ms == 0 {
        return 0;
    }

    let mut attempts = 0;
    let mut current = base_ms;
    while current < ceiling_ms && attempts < 63 {
        current = current.saturating_mul(2);
        attempts += 1;
    }
    attempts
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для Backoff
////////////////////////////////////////////////////////////////////////////////

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CEILING)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
