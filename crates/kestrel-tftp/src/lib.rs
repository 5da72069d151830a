//! TFTP and MTFTP transfer engine for the Kestrel boot client.
//!
//! A [`TftpSession`] owns a [`kestrel_net::Stack`] and drives the RFC
//! 1350 request/negotiate/lock-step state machine over it, with RFC
//! 2347/2348/2349 option negotiation and the private big-block and
//! directory extensions. [`MtftpSession`] layers the multicast dual-path
//! open and passive windowed listen on top, degrading to plain unicast
//! TFTP when the multicast stream never materializes.

pub mod config;
mod error;
pub mod mtftp;
pub mod packet;
pub mod session;

pub use config::{
    ClientConfig, FilterConfig, LogFormat, LoggingConfig, MtftpConfig, load_config,
    validate_config, write_config, write_default_config,
};
pub use error::{Result, TftpError};
pub use mtftp::{ListenOutcome, MtftpInfo, MtftpSession, OpenStatus};
pub use session::{
    DEFAULT_RETRIES, ServerError, SessionState, Sink, TftpSession, TransferOptions,
};
