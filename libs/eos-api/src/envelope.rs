use serde::{Deserialize, Deserializer, Serialize};

use crate::BridgeError;

/// Статус транзакции внутри envelope.
///
/// Неизвестные значения не ломают декодирование всего envelope:
/// они попадают в `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    #[serde(rename = "")]
    Unset,
    New,
    Pending,
    #[serde(other)]
    Other,
}

/// Доменный payload внутри `Record::value`.
///
/// `transaction_tracking` только растёт: каждый stage добавляет ровно
/// одну запись со своим именем.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_as_default")]
    pub transaction_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transaction_status: Status,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transaction_tracking: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transaction_timestamp: String,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::from(e).with_context("decode envelope"))
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::from(e).with_context("encode envelope"))
    }

    pub fn append_trace(&mut self, stage: impl Into<String>) {
        self.transaction_tracking.push(stage.into());
    }
}

// `null` трактуется как отсутствующее поле.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
