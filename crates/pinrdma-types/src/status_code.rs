/// Status code type alias, a plain `u16`.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Codes shared by every layer (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const INVALID_ARG: status_code_t = 3;
}

/// Memory pinning and table status codes (1xxx).
pub mod MemCode {
    use super::status_code_t;

    pub const PERMISSION_DENIED: status_code_t = 1000;
    pub const RESOURCE_EXHAUSTED: status_code_t = 1001;
    pub const INVALID_ADDRESS: status_code_t = 1002;
    pub const OUT_OF_MEMORY: status_code_t = 1003;
    pub const RANGE_OVERFLOW: status_code_t = 1004;
    pub const DMA_MAP_FAILED: status_code_t = 1005;
    pub const KMAP_FAILED: status_code_t = 1006;
    pub const TABLE_NOT_FOUND: status_code_t = 1007;
}

/// RDMA session status codes (2xxx).
pub mod RdmaCode {
    use super::status_code_t;

    pub const DEVICE_NOT_FOUND: status_code_t = 2000;
    pub const TRANSPORT_ERROR: status_code_t = 2001;
    pub const PROTOCOL_ERROR: status_code_t = 2002;
    pub const REMOTE_FAILURE: status_code_t = 2003;
    pub const VERBS_ERROR: status_code_t = 2005;
    pub const POST_FAILED: status_code_t = 2006;
    pub const POLL_FAILED: status_code_t = 2007;
    pub const TIMEOUT: status_code_t = 2008;
    pub const CANCELED: status_code_t = 2009;
    pub const BAD_REQUEST: status_code_t = 2010;
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        StatusCode::INVALID_ARG => "InvalidArg",

        MemCode::PERMISSION_DENIED => "Mem::PermissionDenied",
        MemCode::RESOURCE_EXHAUSTED => "Mem::ResourceExhausted",
        MemCode::INVALID_ADDRESS => "Mem::InvalidAddress",
        MemCode::OUT_OF_MEMORY => "Mem::OutOfMemory",
        MemCode::RANGE_OVERFLOW => "Mem::RangeOverflow",
        MemCode::DMA_MAP_FAILED => "Mem::DmaMapFailed",
        MemCode::KMAP_FAILED => "Mem::KmapFailed",
        MemCode::TABLE_NOT_FOUND => "Mem::TableNotFound",

        RdmaCode::DEVICE_NOT_FOUND => "Rdma::DeviceNotFound",
        RdmaCode::TRANSPORT_ERROR => "Rdma::TransportError",
        RdmaCode::PROTOCOL_ERROR => "Rdma::ProtocolError",
        RdmaCode::REMOTE_FAILURE => "Rdma::RemoteFailure",
        RdmaCode::VERBS_ERROR => "Rdma::VerbsError",
        RdmaCode::POST_FAILED => "Rdma::PostFailed",
        RdmaCode::POLL_FAILED => "Rdma::PollFailed",
        RdmaCode::TIMEOUT => "Rdma::Timeout",
        RdmaCode::CANCELED => "Rdma::Canceled",
        RdmaCode::BAD_REQUEST => "Rdma::BadRequest",

        _ => "UnknownStatusCode",
    }
}

/// Map a status code to the errno a write-style control call returns.
pub fn to_errno(code: status_code_t) -> i32 {
    match code {
        StatusCode::INVALID_ARG | MemCode::RANGE_OVERFLOW | RdmaCode::BAD_REQUEST => libc::EINVAL,
        MemCode::OUT_OF_MEMORY | MemCode::RESOURCE_EXHAUSTED => libc::ENOMEM,
        MemCode::PERMISSION_DENIED => libc::EPERM,
        MemCode::INVALID_ADDRESS | MemCode::DMA_MAP_FAILED | RdmaCode::POLL_FAILED => libc::EFAULT,
        MemCode::TABLE_NOT_FOUND => libc::ENOENT,
        RdmaCode::DEVICE_NOT_FOUND => libc::ENODEV,
        RdmaCode::TRANSPORT_ERROR => libc::EPIPE,
        RdmaCode::TIMEOUT => libc::ETIMEDOUT,
        RdmaCode::CANCELED => libc::EINTR,
        _ => libc::EIO,
    }
}
