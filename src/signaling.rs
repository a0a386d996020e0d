//! Ручной обмен кодами `TYP:ID:{JSON}`.
//!
//! Коды копируются человеком (мессенджер, почта, бумажка), поэтому формат
//! текстовый и плоский. JSON-нагрузка сама может содержать двоеточия,
//! так что строка режется не больше двух раз.

use crate::error::SignalingError;
use crate::peer::types::PeerId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeType {
    Offer,
    Answer,
    Candidate,
}

impl CodeType {
    /// Тег в коде; кандидаты исторически помечены `KANDIDAT`
    pub fn tag(self) -> &'static str {
        match self {
            CodeType::Offer => "OFFER",
            CodeType::Answer => "ANSWER",
            CodeType::Candidate => "KANDIDAT",
        }
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CodeType {
    type Err = SignalingError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "OFFER" => Ok(CodeType::Offer),
            "ANSWER" => Ok(CodeType::Answer),
            "KANDIDAT" | "CANDIDATE" => Ok(CodeType::Candidate),
            other => Err(SignalingError::UnknownCodeType(other.to_string())),
        }
    }
}

/// Разобранный signaling-код
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub kind: CodeType,
    pub sender: PeerId,
    /// JSON как есть, без повторной сериализации
    pub payload: String,
}

impl SignalingMessage {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SignalingError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn expect_kind(self, expected: CodeType) -> Result<Self, SignalingError> {
        if self.kind == expected {
            Ok(self)
        } else {
            Err(SignalingError::WrongCodeType {
                expected,
                found: self.kind,
            })
        }
    }

    /// Обратно в текстовый код
    pub fn to_code(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.kind.tag(),
            self.sender,
            self.payload
        )
    }
}

/// `TYPE:senderID:JSON(payload)`
pub fn encode<T: Serialize + ?Sized>(
    kind: CodeType,
    sender: &PeerId,
    payload: &T,
) -> Result<String, SignalingError> {
    let json = serde_json::to_string(payload)?;
    Ok(SignalingMessage {
        kind,
        sender: sender.clone(),
        payload: json,
    }
    .to_code())
}

pub fn decode(code: &str) -> Result<SignalingMessage, SignalingError> {
    let mut parts = code.trim().splitn(3, SEPARATOR);
    let (Some(tag), Some(sender), Some(payload)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(SignalingError::Format(
            "expected TYPE:ID:{JSON_PAYLOAD}".into(),
        ));
    };
    let kind: CodeType = tag.parse()?;
    if sender.is_empty() {
        return Err(SignalingError::Format("sender id is empty".into()));
    }
    Ok(SignalingMessage {
        kind,
        sender: PeerId::from(sender),
        payload: payload.to_string(),
    })
}
