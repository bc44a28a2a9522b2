pub mod envelope;
pub mod error;
pub mod record;
pub mod tracker;
pub mod util;

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

pub use envelope::{Envelope, Status};
pub use error::{BridgeError, ErrorKind};
pub use record::{FetchError, Fetches, Record};
pub use tracker::{ErrorTracker, ProducePromise, TrackerState};
pub use util::now_ms;

// ════════════════════════════════════════════════════════════════
//  Broker capability
// ════════════════════════════════════════════════════════════════

/// Транзакционная сессия брокера: consumer group + transactional producer.
///
/// Loop владеет сессией эксклюзивно и работает с ней только через этот
/// trait, поэтому любой клиент брокера, реализующий его, взаимозаменяем.
/// Retry begin/commit/abort, управление offset'ами и rebalance: забота
/// реализации.
pub trait TransactSession: Send {
    /// Дождаться хотя бы одной записи или отмены.
    ///
    /// Ошибки отдельных партиций возвращаются в `Fetches::errors` вместе
    /// с успешно полученными записями. При отмене: пустой `Fetches`.
    fn fetch(&mut self, cancel: &CancellationToken) -> Pin<Box<dyn Future<Output = Fetches> + Send + '_>>;

    /// Открыть транзакцию. `ErrorKind::Session`, если она уже открыта
    /// или сессия не транзакционная.
    fn begin(&mut self) -> Result<(), BridgeError>;

    /// Асинхронный produce внутри открытой транзакции. Результат доставки
    /// сообщается через `promise`.
    fn produce(&mut self, record: Record, promise: ProducePromise);

    /// Закрыть транзакцию: commit (offset'ы + produced записи атомарно)
    /// или abort. Дожидается всех незавершённых produce. При abort позиция
    /// consumer'а откатывается к последнему закоммиченному offset'у.
    ///
    /// Возвращает `true`, если commit состоялся.
    fn end(
        &mut self,
        cancel: &CancellationToken,
        commit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BridgeError>> + Send + '_>>;

    /// Освободить сессию. Открытая транзакция abort'ится.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Transformation
// ════════════════════════════════════════════════════════════════

/// Бизнес-правило transform stage: сырые байты → сырые байты.
pub trait Transformer: Send + Sync {
    /// Имя stage, которое добавляется в trace envelope.
    fn name(&self) -> &str;

    /// Ошибка возвращается в loop через handoff как tagged failure.
    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, BridgeError>;
}
