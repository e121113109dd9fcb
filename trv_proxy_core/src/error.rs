use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A sensor or clock handed the controller NaN or an infinity.
    #[error("non-finite input `{field}`: {value}")]
    NonFiniteInput { field: &'static str, value: f64 },
}

pub type Result<T> = std::result::Result<T, CoreError>;
