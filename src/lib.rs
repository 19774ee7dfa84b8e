//! # hexkernel
//!
//! Capability-based security kernel mediating every operation on
//! cryptographic objects.
//!
//! Contexts, certificates, keysets, envelopes, sessions, devices and users
//! live in a kernel-owned object table and are reachable only through
//! handles. Every operation is a message sent to a handle; the kernel checks
//! it against static ACL tables, routes it to the object that should handle
//! it, serialises access to that object across threads and enforces
//! monotonic properties (usage counts, action permissions, locking) before
//! the object ever sees it.
//!
//! ## Public API
//!
//! The public surface is [`Kernel`] and the message vocabulary it speaks.
//! Object implementations, the ACL tables, the secure allocator and key
//! handling are `pub(crate)`.
//!
//! ```no_run
//! use hexkernel::{Kernel, KernelConfig, ObjectType, SubType};
//!
//! let kernel = Kernel::init(KernelConfig::default())?;
//! let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0)?;
//! kernel.send_message(
//!     ctx,
//!     hexkernel::MessageKind::CtxGenKey,
//!     &mut hexkernel::Payload::None,
//!     0,
//! )?;
//! let mut block = *b"sixteen byte msg";
//! kernel.encrypt(ctx, &mut block)?;
//! kernel.destroy_object(ctx)?;
//! # Ok::<(), hexkernel::KernelError>(())
//! ```

// Module declarations.
pub(crate) mod acl;
pub(crate) mod alloc;
pub mod audit;
pub mod config;
pub(crate) mod crypto;
pub mod error;
pub(crate) mod kernel;
pub(crate) mod keys;
pub mod message;
pub(crate) mod objects;
pub(crate) mod selftest;
pub mod types;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub use audit::{AuditEvent, AuditRecord, AuditSink, FileAuditSink};
pub use config::KernelConfig;
pub use error::{status_of, ArgPosition, KernelError, KernelResult};
pub use kernel::Kernel;
pub use message::{
    algorithm, content_type, key_usage, Attribute, CertAction, CertMgmtInfo, CheckType, CompareType,
    CreateObjectInfo, DeriveInfo, KeyItem, KeyMgmtInfo, MechanismType, MessageKind, Payload,
    SignatureData, WrapInfo, UNUSED,
};
pub use types::{Action, ActionPermissions, Handle, ObjectType, PermLevel, SubType};
