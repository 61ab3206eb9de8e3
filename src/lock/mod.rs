// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-process workspace leases.
//!
//! One application instance at a time may edit a workspace root. The lease
//! lives in `<root>/.agentdesk/workspace.lock` as a JSON [`LockToken`], is kept
//! fresh by a heartbeat, and may be reclaimed by another instance once it
//! goes stale.
//!
//! ```rust,ignore
//! use agentdesk::lock::WorkspaceLockManager;
//!
//! let locks = WorkspaceLockManager::new(config.lock.clone());
//! match locks.acquire(&root).await {
//!     Ok(held) => println!("locked {}", held.root.display()),
//!     Err(failure) if failure.is_in_use() => println!("busy: {:?}", failure.owner),
//!     Err(failure) => return Err(failure.into()),
//! }
//! ```

mod liveness;
mod manager;
mod token;

pub use liveness::{local_hostname, ProcessLiveness, SystemLiveness};
pub use manager::{
    lock_file_path, LockAcquired, LockEvent, LockResult, LockStatus, OwnedLock,
    WorkspaceLockManager, LOCK_DIR, LOCK_FILE,
};
pub use token::{LockToken, LOCK_VERSION};
