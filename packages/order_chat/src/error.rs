//! Error taxonomy for chat sessions, with stable codes and the short status
//! strings shown to people.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Transient transport failure. Retried through backoff.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel is not connected")]
    NotConnected,

    /// Identity lookup failed. Fatal for the session.
    #[error("identity lookup failed: {0}")]
    Auth(String),

    #[error("invalid message: {0}")]
    Validation(String),

    /// Storage call failed; the optimistic echo was rolled back.
    #[error("storage error: {0}")]
    Persistence(String),

    #[error("message was not confirmed within {timeout:?}")]
    UnconfirmedSend { timeout: Duration },

    /// Presence updates are best-effort.
    #[error("presence error: {0}")]
    Presence(String),

    #[error("chat session is closed")]
    SessionClosed,
}

impl ChatError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connection(_) => "connection",
            Self::NotConnected => "not_connected",
            Self::Auth(_) => "auth",
            Self::Validation(_) => "validation",
            Self::Persistence(_) => "persistence",
            Self::UnconfirmedSend { .. } => "unconfirmed_send",
            Self::Presence(_) => "presence",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Short status line for the UI. Never carries transport details.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Connection(_) | Self::NotConnected => "Conexão perdida. Tentando reconectar...",
            Self::Auth(_) => "Sessão expirada. Faça login novamente.",
            Self::Validation(_) => "A mensagem não pode estar vazia.",
            Self::Persistence(_) | Self::UnconfirmedSend { .. } => "Falha ao enviar mensagem",
            Self::Presence(_) => "Não foi possível atualizar o status online.",
            Self::SessionClosed => "Chat encerrado.",
        }
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    pub(crate) fn auth(err: anyhow::Error) -> Self {
        Self::Auth(format!("{err:#}"))
    }

    pub(crate) fn connection(err: anyhow::Error) -> Self {
        Self::Connection(format!("{err:#}"))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(ChatError::NotConnected.error_code(), "not_connected");
        assert_eq!(
            ChatError::UnconfirmedSend {
                timeout: Duration::from_secs(10)
            }
            .error_code(),
            "unconfirmed_send"
        );
        assert_eq!(ChatError::Auth("x".into()).error_code(), "auth");
    }

    #[test]
    fn user_messages_hide_transport_details() {
        let err = ChatError::Connection("socket reset by peer at 10.0.0.3".into());
        assert_eq!(err.user_message(), "Conexão perdida. Tentando reconectar...");
        assert!(!err.user_message().contains("socket"));

        let err = ChatError::Persistence("unique constraint".into());
        assert_eq!(err.user_message(), "Falha ao enviar mensagem");
    }

    #[test]
    fn anyhow_context_is_kept() {
        let err = ChatError::persistence(anyhow::anyhow!("disk full").context("insert message"));
        assert_eq!(
            err,
            ChatError::Persistence("insert message: disk full".into())
        );
    }
}
