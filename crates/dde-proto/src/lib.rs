//! Vocabulary shared between the managed DDE core and facility implementations.
//!
//! The underlying IPC facility (the DDEML on Windows, an in-process double in
//! tests) is consumed through the [`DdeApi`] capability trait. Everything the
//! facility and the core exchange — handles, transaction tags, callback
//! records, acknowledgement and error codes — is defined here so that neither
//! side depends on the other.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;

// We re-export these types, because they are used in the public API.
#[rustfmt::skip]
pub use bytes::Bytes;
#[rustfmt::skip]
pub use smol_str;

/// Longest service, topic or item name accepted by the facility, in bytes.
pub const MAX_STRING_SIZE: usize = 255;

/// Identifier of one initialized facility instance.
///
/// Assigned by the facility on initialize; only valid on the OS thread that
/// performed the initialization.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct InstanceId(u32);

impl From<u32> for InstanceId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<InstanceId> for u32 {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i#{}", self.0)
    }
}

/// Identifier of one established conversation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ConvId(u32);

impl From<u32> for ConvId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<ConvId> for u32 {
    fn from(id: ConvId) -> Self {
        id.0
    }
}

impl fmt::Display for ConvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c#{}", self.0)
    }
}

/// Identifier of one advertised service name.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ServiceId(u32);

impl From<u32> for ServiceId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<ServiceId> for u32 {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s#{}", self.0)
    }
}

/// Identifier of one outstanding asynchronous client transaction.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct TransactionId(u32);

impl From<u32> for TransactionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<TransactionId> for u32 {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t#{}", self.0)
    }
}

/// Clipboard data format tag carried by poke/request/advise transactions.
///
/// `1` is `CF_TEXT`, the only format most DDE peers ever use.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct DataFormat(u16);

impl DataFormat {
    pub const TEXT: Self = Self(1);
}

impl From<u16> for DataFormat {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl From<DataFormat> for u16 {
    fn from(format: DataFormat) -> Self {
        format.0
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f#{}", self.0)
    }
}

/// Transaction-type tag of a raw facility callback.
///
/// Discriminants match the XTYP constants of the Windows DDEML so that traces
/// stay comparable with native tooling.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u16)]
pub enum TransactionKind {
    Error = 0x8002,
    AdviseData = 0x4010,
    AdviseRequest = 0x2022,
    AdviseStart = 0x1030,
    AdviseStop = 0x8040,
    Execute = 0x4050,
    Connect = 0x1062,
    ConnectConfirm = 0x7072,
    TransactionComplete = 0x8080,
    Poke = 0x4090,
    Register = 0x80A2,
    Request = 0x20B0,
    Disconnect = 0x90C2,
    Unregister = 0x80D2,
    WildConnect = 0x20E2,
    Monitor = 0x80F2,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Error => "XTYP_ERROR",
            TransactionKind::AdviseData => "XTYP_ADVDATA",
            TransactionKind::AdviseRequest => "XTYP_ADVREQ",
            TransactionKind::AdviseStart => "XTYP_ADVSTART",
            TransactionKind::AdviseStop => "XTYP_ADVSTOP",
            TransactionKind::Execute => "XTYP_EXECUTE",
            TransactionKind::Connect => "XTYP_CONNECT",
            TransactionKind::ConnectConfirm => "XTYP_CONNECT_CONFIRM",
            TransactionKind::TransactionComplete => "XTYP_XACT_COMPLETE",
            TransactionKind::Poke => "XTYP_POKE",
            TransactionKind::Register => "XTYP_REGISTER",
            TransactionKind::Request => "XTYP_REQUEST",
            TransactionKind::Disconnect => "XTYP_DISCONNECT",
            TransactionKind::Unregister => "XTYP_UNREGISTER",
            TransactionKind::WildConnect => "XTYP_WILDCONNECT",
            TransactionKind::Monitor => "XTYP_MONITOR",
        };
        f.write_str(name)
    }
}

/// Positive acknowledgement sent back to the partner.
pub const DDE_FACK: u16 = 0x8000;
/// Partner is busy; retry later.
pub const DDE_FBUSY: u16 = 0x4000;
/// Partner refused the transaction.
pub const DDE_FNOTPROCESSED: u16 = 0x0000;

/// Result a callback hands back to the facility for one raw transaction.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CallbackResult {
    /// Neutral result; the facility applies its default for the tag.
    Ignored,
    /// Yes/no answer (connect, advise-start).
    Accept(bool),
    /// Positive acknowledgement (advise-data, execute, poke).
    Ack,
    /// Busy negative acknowledgement (execute, poke).
    Busy,
    /// Refusal (execute, poke, request).
    NotProcessed,
    /// `CBR_BLOCK`: suspend callbacks for this conversation and re-deliver
    /// the transaction once it is enabled again.
    Block,
    /// Payload answer (request, advise-request).
    Data(Bytes),
}

/// One raw callback invocation, decoded from the facility's C signature.
///
/// String handles are resolved to names before delivery; the `aux` word keeps
/// its tag-specific meaning: the transaction id for
/// [`TransactionKind::TransactionComplete`], the remaining tuple count for
/// [`TransactionKind::AdviseRequest`], and the error code for
/// [`TransactionKind::Error`].
#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub format: DataFormat,
    pub conv: Option<ConvId>,
    /// First string argument (topic name, or service name for register).
    pub str1: Option<SmolStr>,
    /// Second string argument (item name, or service name for connect).
    pub str2: Option<SmolStr>,
    pub data: Option<Bytes>,
    pub aux: u32,
    /// Filled in by the callback; read back by the facility.
    pub ret: CallbackResult,
}

impl Transaction {
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            format: DataFormat::TEXT,
            conv: None,
            str1: None,
            str2: None,
            data: None,
            aux: 0,
            ret: CallbackResult::Ignored,
        }
    }

    /// Transaction id carried by a transaction-complete callback.
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::from(self.aux)
    }

    /// Remaining consumer count carried by an advise-request callback.
    pub fn remaining(&self) -> u32 {
        self.aux
    }
}

/// Numeric facility error code (the DMLERR range of the DDEML).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SysError(u16);

impl SysError {
    pub const NO_ERROR: Self = Self(0x0000);
    pub const ADVACKTIMEOUT: Self = Self(0x4000);
    pub const BUSY: Self = Self(0x4001);
    pub const DATAACKTIMEOUT: Self = Self(0x4002);
    pub const DLL_NOT_INITIALIZED: Self = Self(0x4003);
    pub const DLL_USAGE: Self = Self(0x4004);
    pub const EXECACKTIMEOUT: Self = Self(0x4005);
    pub const INVALIDPARAMETER: Self = Self(0x4006);
    pub const LOW_MEMORY: Self = Self(0x4007);
    pub const MEMORY_ERROR: Self = Self(0x4008);
    pub const NOTPROCESSED: Self = Self(0x4009);
    pub const NO_CONV_ESTABLISHED: Self = Self(0x400A);
    pub const POKEACKTIMEOUT: Self = Self(0x400B);
    pub const POSTMSG_FAILED: Self = Self(0x400C);
    pub const REENTRANCY: Self = Self(0x400D);
    pub const SERVER_DIED: Self = Self(0x400E);
    pub const SYS_ERROR: Self = Self(0x400F);
    pub const UNADVACKTIMEOUT: Self = Self(0x4010);
    pub const UNFOUND_QUEUE_ID: Self = Self(0x4011);

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NO_ERROR => "DMLERR_NO_ERROR",
            Self::ADVACKTIMEOUT => "DMLERR_ADVACKTIMEOUT",
            Self::BUSY => "DMLERR_BUSY",
            Self::DATAACKTIMEOUT => "DMLERR_DATAACKTIMEOUT",
            Self::DLL_NOT_INITIALIZED => "DMLERR_DLL_NOT_INITIALIZED",
            Self::DLL_USAGE => "DMLERR_DLL_USAGE",
            Self::EXECACKTIMEOUT => "DMLERR_EXECACKTIMEOUT",
            Self::INVALIDPARAMETER => "DMLERR_INVALIDPARAMETER",
            Self::LOW_MEMORY => "DMLERR_LOW_MEMORY",
            Self::MEMORY_ERROR => "DMLERR_MEMORY_ERROR",
            Self::NOTPROCESSED => "DMLERR_NOTPROCESSED",
            Self::NO_CONV_ESTABLISHED => "DMLERR_NO_CONV_ESTABLISHED",
            Self::POKEACKTIMEOUT => "DMLERR_POKEACKTIMEOUT",
            Self::POSTMSG_FAILED => "DMLERR_POSTMSG_FAILED",
            Self::REENTRANCY => "DMLERR_REENTRANCY",
            Self::SERVER_DIED => "DMLERR_SERVER_DIED",
            Self::SYS_ERROR => "DMLERR_SYS_ERROR",
            Self::UNADVACKTIMEOUT => "DMLERR_UNADVACKTIMEOUT",
            Self::UNFOUND_QUEUE_ID => "DMLERR_UNFOUND_QUEUE_ID",
            _ => "DMLERR_UNKNOWN",
        }
    }
}

impl From<u16> for SysError {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl From<SysError> for u16 {
    fn from(error: SysError) -> Self {
        error.0
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.name(), self.0)
    }
}

/// Payload of one client-initiated transaction.
#[derive(Debug, Clone)]
pub enum TransactionRequest {
    Execute {
        command: Bytes,
    },
    Poke {
        item: SmolStr,
        format: DataFormat,
        data: Bytes,
    },
    Request {
        item: SmolStr,
        format: DataFormat,
    },
    AdviseStart {
        item: SmolStr,
        format: DataFormat,
        /// `XTYPF_NODATA`: notifications carry no payload.
        warm: bool,
        /// `XTYPF_ACKREQ`: the server waits for an acknowledgement before
        /// posting the next notification.
        ack_required: bool,
    },
    AdviseStop {
        item: SmolStr,
        format: DataFormat,
    },
}

/// Whether a client transaction blocks for its result or completes through a
/// transaction-complete callback.
#[derive(Debug, Clone, Copy)]
pub enum TransactionMode {
    Blocking(Duration),
    Async,
}

/// Outcome of issuing a client transaction.
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    /// Blocking transaction finished; request carries the payload bytes.
    Complete(Option<Bytes>),
    /// Asynchronous transaction accepted; completion arrives later under
    /// this id.
    Pending(TransactionId),
}

/// Argument of [`DdeApi::enable_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    /// `EC_DISABLE`: queue callbacks instead of delivering them.
    Disable,
    /// `EC_ENABLEALL`: deliver queued and future callbacks.
    EnableAll,
}

/// Callback through which the facility hands raw transactions to the core.
///
/// The facility invokes it on the owning thread of the instance, fills
/// nothing in afterwards and reads [`Transaction::ret`] back when the call
/// returns.
pub type DdeCallback = Arc<dyn Fn(&mut Transaction) + Send + Sync>;

/// Capability trait over the underlying IPC facility.
///
/// Every method must be called from the owning thread of `instance` (the
/// thread that ran [`DdeApi::initialize`]); the managed core guarantees this
/// by funneling all calls through its single-thread executor. Fallible
/// operations surface the facility's last-error code directly in the `Err`
/// variant.
pub trait DdeApi: Send + Sync + 'static {
    fn initialize(&self, callback: DdeCallback) -> Result<InstanceId, SysError>;

    /// Returns `false` when the instance was not known.
    fn uninitialize(&self, instance: InstanceId) -> bool;

    fn connect(&self, instance: InstanceId, service: &str, topic: &str) -> Result<ConvId, SysError>;

    /// Returns `false` when the conversation was not known.
    fn disconnect(&self, instance: InstanceId, conv: ConvId) -> bool;

    fn client_transaction(
        &self,
        instance: InstanceId,
        conv: ConvId,
        request: TransactionRequest,
        mode: TransactionMode,
    ) -> Result<TransactionOutcome, SysError>;

    /// Returns `false` when the transaction already completed or was unknown.
    fn abandon_transaction(&self, instance: InstanceId, conv: ConvId, transaction: TransactionId) -> bool;

    /// Gates callback delivery for one conversation, or for the whole
    /// instance when `conv` is `None`.
    fn enable_callback(&self, instance: InstanceId, conv: Option<ConvId>, state: CallbackState)
        -> Result<(), SysError>;

    fn register_service(&self, instance: InstanceId, service: &str) -> Result<ServiceId, SysError>;

    /// Returns `false` when the service was not registered.
    fn unregister_service(&self, instance: InstanceId, service: ServiceId) -> bool;

    /// Triggers one advise-request callback per conversation holding an
    /// active advise loop matching the (topic, item) pair; `None` is the
    /// wildcard.
    fn post_advise(&self, instance: InstanceId, topic: Option<&str>, item: Option<&str>) -> Result<(), SysError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_is_prefixed() {
        assert_eq!(ConvId::from(7).to_string(), "c#7");
        assert_eq!(TransactionId::from(42).to_string(), "t#42");
        assert_eq!(InstanceId::from(1).to_string(), "i#1");
        assert_eq!(ServiceId::from(3).to_string(), "s#3");
    }

    #[test]
    fn sys_error_names() {
        assert_eq!(SysError::NOTPROCESSED.name(), "DMLERR_NOTPROCESSED");
        assert_eq!(SysError::from(0x4009).code(), 0x4009);
        assert_eq!(SysError::from(0x1234).name(), "DMLERR_UNKNOWN");
        assert_eq!(SysError::NO_CONV_ESTABLISHED.to_string(), "DMLERR_NO_CONV_ESTABLISHED (0x400A)");
    }

    #[test]
    fn transaction_aux_accessors() {
        let mut t = Transaction::new(TransactionKind::TransactionComplete);
        t.aux = 9;
        assert_eq!(t.transaction_id(), TransactionId::from(9));
        let mut t = Transaction::new(TransactionKind::AdviseRequest);
        t.aux = 2;
        assert_eq!(t.remaining(), 2);
    }

    #[test]
    fn transaction_kind_tags_match_ddeml() {
        assert_eq!(TransactionKind::AdviseData as u16, 0x4010);
        assert_eq!(TransactionKind::TransactionComplete as u16, 0x8080);
        assert_eq!(TransactionKind::Disconnect as u16, 0x90C2);
    }
}
