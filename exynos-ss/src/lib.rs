pub mod capture;
pub mod clock;
pub mod config;
pub mod context;
pub mod control;
pub mod crash_key;
pub mod dumper;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod image;
pub mod layout;
pub mod platform;
pub mod pstore;
pub mod recorder;
pub mod region;
pub mod ring;
pub mod sfr;
pub mod stats;
pub mod symbols;

use std::sync::Arc;

use once_cell::sync::OnceCell;

pub use capture::CaptureOutcome;
pub use clock::{BootClock, Clock, ManualClock};
pub use config::Config;
pub use context::{ContextBuilder, DiagnosticsContext, parse_base_address};
pub use control::ControlSurface;
pub use dumper::{DumpLine, Dumper};
pub use error::{Result, SnapshotError};
pub use image::SnapshotImage;
pub use platform::{CpuStateSnapshotter, NoopSnapshotter, NullPlatform, PlatformHooks, TaskInfo};
pub use recorder::LockState;
pub use region::{AnonymousReserver, FileReserver, MemoryReserver};
pub use stats::RecorderStats;
pub use symbols::{NoSymbols, SymbolResolver, SymbolTable};

static GLOBAL: OnceCell<Arc<DiagnosticsContext>> = OnceCell::new();

/// Publish `ctx` for call sites that cannot be handed a reference. Only the
/// first install wins; later ones get their context back.
pub fn install(ctx: Arc<DiagnosticsContext>) -> std::result::Result<(), Arc<DiagnosticsContext>> {
    GLOBAL.set(ctx)
}

/// The installed context, if any.
pub fn get() -> Option<&'static Arc<DiagnosticsContext>> {
    GLOBAL.get()
}
