//! Utility modules.

pub mod cancel;
pub mod debug;
pub mod path;
pub mod platform;
pub mod shell;

pub use cancel::CancellationToken;
pub use debug::{init_debug_logging, is_debug_enabled, SDBG_DEBUG_ENV};
pub use path::{expand_home, normalize_path};
pub use platform::{filesystem_supported, get_arch, get_wsl_version, is_supported};
pub use shell::{join_args, quote, split_args};
