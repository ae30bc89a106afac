use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingCredential,

    #[error("Invalid or expired token")]
    InvalidToken,
}
