use crate::util::now_ms;

/// Запись брокера: непрозрачный payload плюс координаты источника.
///
/// После fetch не изменяется. Loop владеет записью целиком; в stage на время
/// одного rendezvous уходит только копия `value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    /// -1: ещё не назначен (исходящая запись).
    pub partition: i32,
    /// -1: ещё не назначен (исходящая запись).
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Timestamp в миллисекундах (Unix epoch).
    pub ts_ms: i64,
}

impl Record {
    /// Исходящая запись для produce: partition/offset назначит брокер.
    pub fn to(topic: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: -1,
            offset: -1,
            key: None,
            value,
            ts_ms: now_ms(),
        }
    }

    pub fn with_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.key = key;
        self
    }
}

/// Per-partition ошибка fetch. Не фатальна: остальные записи батча
/// обрабатываются.
#[derive(Clone, Debug)]
pub struct FetchError {
    pub topic: String,
    pub partition: i32,
    pub error: crate::BridgeError,
}

/// Результат одного fetch: записи в порядке fetch + частичные ошибки.
#[derive(Clone, Debug, Default)]
pub struct Fetches {
    pub records: Vec<Record>,
    pub errors: Vec<FetchError>,
}

impl Fetches {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
