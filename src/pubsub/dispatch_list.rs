use std::sync::atomic::{AtomicU64, Ordering};

/// Глобальный счётчик идентификаторов списков: дескриптор одного списка
/// никогда не совпадёт с дескриптором другого.
static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// Непрозрачный дескриптор элемента [`DispatchList`].
///
/// Остаётся валидным до удаления элемента. После удаления слот получает
/// новое поколение, и старый дескриптор больше ничего не находит.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    list: u64,
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Упорядоченный список получателей одного ключа.
///
/// Слоты хранятся в арене, порядок вставки поддерживается двусвязным
/// списком индексов. Вставка в конец и удаление по дескриптору выполняются
/// за O(1), освобождённые слоты переиспользуются.
#[derive(Debug)]
pub struct DispatchList<T> {
    id: u64,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Итератор по значениям в порядке вставки.
pub struct Iter<'a, T> {
    list: &'a DispatchList<T>,
    cursor: Option<usize>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<T> DispatchList<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Добавляет значение в конец списка и возвращает его дескриптор.
    pub fn push(
        &mut self,
        value: T,
    ) -> EntryHandle {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.value = Some(value);
                slot.prev = self.tail;
                slot.next = None;
                index
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    generation: 0,
                    prev: self.tail,
                    next: None,
                });
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        EntryHandle {
            list: self.id,
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Удаляет элемент по дескриптору. Чужой или устаревший дескриптор
    /// возвращает `None` и список не меняет.
    pub fn remove(
        &mut self,
        handle: EntryHandle,
    ) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }

        let (prev, next) = {
            let slot = &self.slots[handle.index];
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }

        let slot = &mut self.slots[handle.index];
        let value = slot.value.take();
        slot.generation += 1;
        slot.prev = None;
        slot.next = None;
        self.free.push(handle.index);
        self.len -= 1;
        value
    }

    /// Проверяет, что дескриптор указывает на живой элемент этого списка.
    pub fn contains(
        &self,
        handle: EntryHandle,
    ) -> bool {
        handle.list == self.id
            && self
                .slots
                .get(handle.index)
                .is_some_and(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    pub fn get(
        &self,
        handle: EntryHandle,
    ) -> Option<&T> {
        if self.contains(handle) {
            self.slots[handle.index].value.as_ref()
        } else {
            None
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Забирает все значения в порядке вставки. Все выданные дескрипторы
    /// становятся недействительными.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index];
            cursor = slot.next;
            if let Some(value) = slot.value.take() {
                values.push(value);
            }
            slot.generation += 1;
            slot.prev = None;
            slot.next = None;
            self.free.push(index);
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        values
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl<T> Default for DispatchList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.list.slots[index];
        self.cursor = slot.next;
        slot.value.as_ref()
    }
}

impl<'a, T> IntoIterator for &'a DispatchList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
