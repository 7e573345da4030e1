mod apply;
mod cache;
mod error;
mod exposure;
mod finalize;
mod fs_utils;
mod layout;
mod lock;
mod marker;
mod resolve;
mod snapshot;
mod staging;
mod swap;
mod verify;

pub use apply::{
    apply, install, ApplyReport, InstallMode, InstallOperation, InstallSource,
};
pub use cache::TarballCache;
pub use error::{InstallError, InstallFailure, InstallStep};
pub use exposure::{
    bin_entry_paths, bin_path, command_entries, commands_targeting, entry_target,
    expose_command, relink_package, remove_exposed_command, LinkReport,
};
pub use finalize::{
    FinalizationError, FinalizationOutcome, FinalizationRunner, FinalizationStep, HookError,
    HookModule, LoadedModule, ModuleLoader,
};
pub use layout::{default_user_prefix, GlobalNamespace, STATE_DIR};
pub use lock::NamespaceLock;
pub use marker::{read_active_operation, ActiveOperation, OperationPhase};
pub use resolve::{command_stem, locate_command, resolve_command, SearchContext};
pub use snapshot::{installed_packages, snapshot, PackageSnapshot, IGNORED_BIN_ENTRIES};
pub use verify::{
    relink_installed, repair_namespace, verify_namespace, NamespaceProblem, RepairReport,
};
