use std::fmt;
use std::io;
use thiserror::Error;

/// Errors surfaced by the port mapping machinery
#[derive(Debug, Error)]
pub enum NatError {
    /// UPnP IGD errors
    #[error("UPnP error: {0}")]
    Upnp(#[from] UpnpError),

    /// NAT-PMP errors
    #[error("NAT-PMP error: {0}")]
    NatPmp(#[from] NatPmpError),

    /// PCP errors
    #[error("PCP error: {0}")]
    Pcp(#[from] PcpError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout errors
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Feature not available on this host or network
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),
}

/// UPnP IGD control errors
#[derive(Debug, Error)]
pub enum UpnpError {
    /// SOAP fault with error code
    #[error("SOAP fault {code}: {description}")]
    SoapFault { code: u16, description: String },

    /// HTTP error without a parsable SOAP fault
    #[error("HTTP error {code}: {reason}")]
    HttpError { code: u16, reason: String },

    /// Transport failure talking to the control URL
    #[error("Request failed: {0}")]
    Request(String),

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    XmlParseError(String),

    /// Invalid response
    #[error("Invalid UPnP response: {0}")]
    InvalidResponse(String),
}

impl UpnpError {
    /// SOAP fault code carried by this error, if any
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::SoapFault { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Known IGD error code carried by this error, if any
    pub fn error_code(&self) -> Option<UpnpErrorCode> {
        self.code().and_then(UpnpErrorCode::from_code)
    }

    pub fn is(&self, code: UpnpErrorCode) -> bool {
        self.error_code() == Some(code)
    }
}

impl From<reqwest::Error> for UpnpError {
    fn from(e: reqwest::Error) -> Self {
        UpnpError::Request(e.to_string())
    }
}

impl From<xmltree::ParseError> for UpnpError {
    fn from(e: xmltree::ParseError) -> Self {
        UpnpError::XmlParseError(e.to_string())
    }
}

/// UPnP error codes from the IGD specifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UpnpErrorCode {
    /// Invalid action
    InvalidAction = 401,

    /// Invalid args
    InvalidArgs = 402,

    /// Action failed
    ActionFailed = 501,

    /// Action not authorized
    ActionNotAuthorized = 606,

    /// Port mapping not found
    NoSuchEntryInArray = 714,

    /// Port mapping conflict
    ConflictInMappingEntry = 718,

    /// Same port values required
    SamePortValuesRequired = 724,

    /// Only permanent lease supported
    OnlyPermanentLeasesSupported = 725,
}

impl fmt::Display for UpnpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAction => write!(f, "Invalid Action"),
            Self::InvalidArgs => write!(f, "Invalid Arguments"),
            Self::ActionFailed => write!(f, "Action Failed"),
            Self::ActionNotAuthorized => write!(f, "Action Not Authorized"),
            Self::NoSuchEntryInArray => write!(f, "No Such Entry In Array"),
            Self::ConflictInMappingEntry => write!(f, "Conflict in Mapping Entry"),
            Self::SamePortValuesRequired => write!(f, "Same Port Values Required"),
            Self::OnlyPermanentLeasesSupported => write!(f, "Only Permanent Leases Supported"),
        }
    }
}

impl UpnpErrorCode {
    /// Convert from u16 error code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            401 => Some(Self::InvalidAction),
            402 => Some(Self::InvalidArgs),
            501 => Some(Self::ActionFailed),
            606 => Some(Self::ActionNotAuthorized),
            714 => Some(Self::NoSuchEntryInArray),
            718 => Some(Self::ConflictInMappingEntry),
            724 => Some(Self::SamePortValuesRequired),
            725 => Some(Self::OnlyPermanentLeasesSupported),
            _ => None,
        }
    }
}

/// NAT-PMP errors (RFC 6886)
#[derive(Debug, Error)]
pub enum NatPmpError {
    #[error("Unsupported version")]
    UnsupportedVersion,

    #[error("Not authorized / refused")]
    NotAuthorized,

    #[error("Network failure")]
    NetworkFailure,

    #[error("Out of resources")]
    OutOfResources,

    #[error("Unsupported opcode")]
    UnsupportedOpcode,

    #[error("Unknown result code {0}")]
    Unknown(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("No response after {0} attempts")]
    NoResponse(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NatPmpError {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::UnsupportedVersion,
            2 => Self::NotAuthorized,
            3 => Self::NetworkFailure,
            4 => Self::OutOfResources,
            5 => Self::UnsupportedOpcode,
            other => Self::Unknown(other),
        }
    }
}

/// PCP errors (RFC 6887 §7.4)
#[derive(Debug, Error)]
pub enum PcpError {
    #[error("PCP result code {code} ({})", Self::describe(*code))]
    ResultCode { code: u8 },

    #[error("Invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("No response after {0} attempts")]
    NoResponse(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PcpError {
    pub fn from_code(code: u8) -> Self {
        Self::ResultCode { code }
    }

    fn describe(code: u8) -> &'static str {
        match code {
            1 => "Unsupported Version",
            2 => "Not Authorized",
            3 => "Malformed Request",
            4 => "Unsupported Opcode",
            5 => "Unsupported Option",
            6 => "Malformed Option",
            7 => "Network Failure",
            8 => "No Resources",
            9 => "Unsupported Protocol",
            10 => "User Ex Quota",
            11 => "Cannot Provide External",
            12 => "Address Mismatch",
            13 => "Excessive Remote Peers",
            _ => "Unknown Error",
        }
    }
}

/// Result type for NAT operations
pub type NatResult<T> = Result<T, NatError>;
