use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColorimeterError {
    #[error("hardware I/O failure: {0}")]
    HardwareIo(String),
    #[error("no archive named '{0}'")]
    ArchiveNotFound(String),
    #[error("archive '{name}' is malformed: {reason}")]
    ArchiveFormat { name: String, reason: String },
    #[error("archive I/O failure: {0}")]
    ArchiveIo(#[from] std::io::Error),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("pause sensor stayed above threshold for {0:.1} s")]
    PauseTimeout(f64),
    #[error("failed to render plot: {0}")]
    Plot(String),
}

impl From<serialport::Error> for ColorimeterError {
    fn from(value: serialport::Error) -> Self {
        ColorimeterError::HardwareIo(value.to_string())
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for ColorimeterError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        ColorimeterError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for ColorimeterError {
    fn from(value: image::ImageError) -> Self {
        ColorimeterError::Plot(value.to_string())
    }
}
