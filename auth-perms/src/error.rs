use thiserror::Error;

/// Infrastructure failures raised while answering an authorization query.
///
/// A denial is never an error: `authorize` returns `Ok(false)` for it. Every
/// variant here means the decision could not be determined.
#[derive(Error, Debug)]
pub enum PermsError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl PermsError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptRecord(message.into())
    }
}

impl From<sqlx::Error> for PermsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                PermsError::CorruptRecord(err.to_string())
            }
            _ => PermsError::StoreUnavailable(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PermsError>;
