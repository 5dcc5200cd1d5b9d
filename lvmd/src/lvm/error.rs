use snafu::Snafu;

/// Errors which can be encountered whilst driving the lvm command line
/// tool and interpreting its reports.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to json parse {command} output: {error}"))]
    JsonParsing { command: String, error: String },
    #[snafu(display("{command} command failed: {error}"))]
    LvmBinErr { command: String, error: String },
    #[snafu(display("Failed to spawn/wait for {command} command: {source}"))]
    LvmBinSpawnErr {
        command: String,
        source: std::io::Error,
    },
    #[snafu(display("Volume group {name} not found"))]
    VgNotFound { name: String },
    #[snafu(display("Logical volume {name} not found"))]
    LvNotFound { name: String },
    #[snafu(display("Thin pool {name} not found"))]
    PoolNotFound { name: String },
    #[snafu(display("{error}"))]
    NoSpace { error: String },
    #[snafu(display(
        "Logical volume {name} cannot be shrunk from {current} to {requested} bytes"
    ))]
    CannotShrink {
        name: String,
        current: u64,
        requested: u64,
    },
    #[snafu(display("{raw} is an invalid length lv_attr"))]
    InvalidLvAttr { raw: String },
    #[snafu(display("Unknown {field} code '{code}' in lv_attr"))]
    UnknownAttrCode { field: &'static str, code: char },
    #[snafu(display("Unknown access: {access}"))]
    UnknownAccessType { access: String },
    #[snafu(display("Cannot take snapshot of non-thin volume: {name}"))]
    SnapshotNonThin { name: String },
    #[snafu(display("Unhealthy logical volume: {reason}"))]
    Unhealthy { reason: String },
}

/// Last-resort classification for invocations whose report could not be
/// decoded at all: lvm then reports missing objects only through stderr
/// text, commonly with exit code 5. Whenever a report is available, its
/// emptiness is the authoritative signal instead.
pub(crate) fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found") || stderr.contains("Failed to find")
}
