//! USB error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB error types
///
/// Transfer outcomes discovered by the completion and error engines travel
/// back to callers as one of these, either directly from a blocking call or
/// as the `Err` side of an asynchronous completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// USB host already initialized
    AlreadyInitialized,
    /// Host controller not running
    NotInitialized,
    /// Descriptor pool or pipe table exhausted (retryable)
    NoResources,
    /// Device answered with a STALL handshake
    Stall,
    /// Transaction, babble or data buffer error
    TransactionError,
    /// Device left the bus while the transfer was pending
    DeviceDisconnected,
    /// Synchronous wait exceeded its deadline
    Timeout,
    /// Transfer was cancelled or the controller is shutting down
    ShuttingDown,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// Unsupported operation
    Unsupported,
    /// Port error
    PortError,
    /// Host system error (DMA error)
    HostSystemError,
}

impl UsbError {
    /// Negative errno-style code used in completion results
    pub const fn code(self) -> i32 {
        match self {
            Self::AlreadyInitialized => -114,
            Self::NotInitialized => -6,
            Self::NoResources => -12,
            Self::Stall => -32,
            Self::TransactionError => -5,
            Self::DeviceDisconnected => -19,
            Self::Timeout => -110,
            Self::ShuttingDown => -108,
            Self::InvalidParameter => -22,
            Self::InvalidState => -16,
            Self::Unsupported => -95,
            Self::PortError => -71,
            Self::HostSystemError => -70,
        }
    }

    /// Convert a negative result code back into an error
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -114 => Self::AlreadyInitialized,
            -6 => Self::NotInitialized,
            -12 => Self::NoResources,
            -32 => Self::Stall,
            -5 => Self::TransactionError,
            -19 => Self::DeviceDisconnected,
            -110 => Self::Timeout,
            -108 => Self::ShuttingDown,
            -22 => Self::InvalidParameter,
            -16 => Self::InvalidState,
            -95 => Self::Unsupported,
            -71 => Self::PortError,
            -70 => Self::HostSystemError,
            _ => return None,
        })
    }

    /// Whether the same request may succeed if simply resubmitted
    ///
    /// A stall needs a CLEAR_FEATURE(ENDPOINT_HALT) first and a disconnect is
    /// final for the pipe, so neither is retryable.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NoResources | Self::TransactionError | Self::Timeout
        )
    }
}

/// Decode a completion result code: non-negative values are byte counts
pub fn result_from_code(code: i32) -> Result<usize> {
    if code >= 0 {
        Ok(code as usize)
    } else {
        Err(UsbError::from_code(code).unwrap_or(UsbError::TransactionError))
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "USB host already initialized"),
            Self::NotInitialized => write!(f, "USB host not initialized"),
            Self::NoResources => write!(f, "No resources available"),
            Self::Stall => write!(f, "USB stall"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::DeviceDisconnected => write!(f, "Device disconnected"),
            Self::Timeout => write!(f, "Timeout"),
            Self::ShuttingDown => write!(f, "Transfer cancelled"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::Unsupported => write!(f, "Unsupported operation"),
            Self::PortError => write!(f, "Port error"),
            Self::HostSystemError => write!(f, "Host system error"),
        }
    }
}
