//! # Taxonomia de erros do motor
//!
//! O motor nunca converte um erro em texto livre no ponto de origem: cada erro
//! carrega um `kind` de um conjunto fechado (ver `ErrorKind`), e esse kind viaja
//! através dos eventos persistidos até que um relatório ou UI o renderize.
//!
//! Isso é diferente do esquema de códigos numéricos (`E1001`, `E2003`, ...) usado
//! em versões anteriores deste runner: a especificação exige nomes de kind
//! neutros em linguagem (`template_missing_key`, `sandbox_timeout`, ...), então
//! a representação mais fiel em Rust é um enum `thiserror` serializável como
//! string, não um newtype sobre `u16`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Um kind de erro do motor, como descrito na taxonomia da especificação.
///
/// `Serialize`/`Deserialize` usam `rename_all = "snake_case"` para que o valor
/// gravado nos artefatos (`errors: [{kind: "wait_timeout", ...}]`) seja
/// exatamente o nome declarado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Configuration — fatais para a execução, detectados na validação.
    #[error("missing_service")]
    MissingService,
    #[error("invalid_scenario")]
    InvalidScenario,
    #[error("invalid_sut")]
    InvalidSut,

    // Template — falham apenas o step corrente.
    #[error("template_missing_key")]
    TemplateMissingKey,
    #[error("template_parse")]
    TemplateParse,

    // Sandbox — falham apenas a avaliação corrente.
    #[error("sandbox_forbidden_node")]
    SandboxForbiddenNode,
    #[error("sandbox_timeout")]
    SandboxTimeout,

    // Transport — falham a tentativa de Http; podem ser re-tentados pela policy.
    #[error("dns")]
    Dns,
    #[error("connect")]
    Connect,
    #[error("tls")]
    Tls,
    #[error("timeout")]
    Timeout,
    #[error("transport")]
    Transport,

    // Response.
    #[error("status")]
    Status,
    #[error("body_decode")]
    BodyDecode,

    // Extraction.
    #[error("extraction_missing_path")]
    ExtractionMissingPath,

    // Wait.
    #[error("wait_timeout")]
    WaitTimeout,

    // Assertion.
    #[error("assertion_failed")]
    AssertionFailed,

    // Instance-level.
    #[error("max_steps_exceeded")]
    MaxStepsExceeded,
    #[error("cancelled")]
    Cancelled,
    #[error("internal")]
    Internal,

    // Store.
    #[error("store_write")]
    StoreWrite,
    #[error("store_corrupt")]
    StoreCorrupt,
}

impl ErrorKind {
    /// Nome estável do kind, idêntico ao que é persistido em `errors[].kind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingService => "missing_service",
            ErrorKind::InvalidScenario => "invalid_scenario",
            ErrorKind::InvalidSut => "invalid_sut",
            ErrorKind::TemplateMissingKey => "template_missing_key",
            ErrorKind::TemplateParse => "template_parse",
            ErrorKind::SandboxForbiddenNode => "sandbox_forbidden_node",
            ErrorKind::SandboxTimeout => "sandbox_timeout",
            ErrorKind::Dns => "dns",
            ErrorKind::Connect => "connect",
            ErrorKind::Tls => "tls",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Status => "status",
            ErrorKind::BodyDecode => "body_decode",
            ErrorKind::ExtractionMissingPath => "extraction_missing_path",
            ErrorKind::WaitTimeout => "wait_timeout",
            ErrorKind::AssertionFailed => "assertion_failed",
            ErrorKind::MaxStepsExceeded => "max_steps_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
            ErrorKind::StoreWrite => "store_write",
            ErrorKind::StoreCorrupt => "store_corrupt",
        }
    }
}

/// Um erro estruturado anexado a uma Observation ou AssertionResult.
///
/// `path` é preenchido para erros de template/extração; `expected`/`actual`
/// para falhas de assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ObservedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            expected: None,
            actual: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_expected_actual(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

/// Erro fatal de configuração, levantado pela validação de SUT/Scenario.
///
/// Ao contrário de `ObservedError` (que viaja dentro de uma Observation), um
/// `ConfigError` impede a execução de começar.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ConfigError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConfigError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_as_str_matches_serde_rename() {
        let kind = ErrorKind::WaitTimeout;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"wait_timeout\"");
        assert_eq!(kind.as_str(), "wait_timeout");
    }

    #[test]
    fn observed_error_builders_are_optional() {
        let err = ObservedError::new(ErrorKind::ExtractionMissingPath, "no match")
            .with_path("$.items[0].id");
        assert_eq!(err.path.as_deref(), Some("$.items[0].id"));
        assert!(err.expected.is_none());
    }
}
