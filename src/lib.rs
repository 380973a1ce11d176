//! # toolhost
//!
//! Tool-runtime orchestration: turns declarative tool-server descriptions
//! ("run this package with this runner", "connect to this event stream")
//! into platform-correct child processes or network connections, provisions
//! the base runtimes they need, isolates each tool's dependencies, and
//! manages process lifecycles with guaranteed cleanup.
//!
//! ## Architecture
//!
//! ```text
//!   registry ──► resolver ──► platform adapter ──► protocol session
//!      ▲            │                                   │
//!      │            ▼                                   ▼
//!  installer   runtime provisioner              child process / SSE
//!              (per-OS strategy)
//! ```
//!
//! ## Request Flow
//! 1. The registry supplies a declared server config
//! 2. The resolver maps its logical command to provisioned executables
//! 3. The platform adapter rewrites the invocation for the host OS
//! 4. A session spawns the server, runs one `tools/list` or `tools/call`
//!    exchange, and is torn down unconditionally
//!
//! ## Modules
//! - `mcp`: registry, resolver, installer, protocol sessions, facade
//! - `runtime`: per-OS provisioning strategies and isolated environments
//! - `platform`: pure OS-specific invocation rewriting

pub mod mcp;
pub mod platform;
pub mod runtime;

pub use mcp::McpToolManager;
pub use runtime::EnvSnapshot;
