use crate::lvm::{error, error::Error};

use serde::de::DeserializeOwned;
use snafu::ResultExt;
use std::{
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};

/// Path of the lvm binary on the host.
const LVM: &str = "/sbin/lvm";
/// Path of the nsenter binary used for containerized execution.
const NSENTER: &str = "/usr/bin/nsenter";
/// Join the mount, UTS, IPC, net and PID namespaces of PID 1.
const NSENTER_ARGS: [&str; 7] = ["-m", "-u", "-i", "-n", "-p", "-t", "1"];

/// Whether lvm invocations must be wrapped with nsenter because the daemon
/// runs inside a container but administers the host. Set once at startup.
static CONTAINERIZED: AtomicBool = AtomicBool::new(false);

/// Enable or disable the nsenter wrapping of every lvm invocation.
pub fn set_containerized(containerized: bool) {
    CONTAINERIZED.store(containerized, Ordering::Relaxed);
}

fn containerized() -> bool {
    CONTAINERIZED.load(Ordering::Relaxed)
}

/// The lvm sub-commands driven by this daemon.
#[derive(AsRefStr, EnumString, Display)]
enum LvmSubCmd {
    /// Display information about volume groups.
    #[strum(serialize = "vgs")]
    VGList,
    /// Display information about logical volumes.
    #[strum(serialize = "lvs")]
    LVList,
    /// Report volume groups and logical volumes in one invocation.
    #[strum(serialize = "fullreport")]
    FullReport,
    /// Create a logical volume.
    #[strum(serialize = "lvcreate")]
    LVCreate,
    /// Change the attributes of logical volume(s).
    #[strum(serialize = "lvchange")]
    LVChange,
    /// Resize the logical volume.
    #[strum(serialize = "lvresize")]
    LVResize,
    /// Remove logical volume(s) from the system.
    #[strum(serialize = "lvremove")]
    LVRemove,
    /// Rename a logical volume.
    #[strum(serialize = "lvrename")]
    LVRename,
}

/// LVM wrapper over `Command` with added qol such as error mapping and
/// decoding of json output reports. The argument vector is kept separate
/// from the spawned process so it can be logged and inspected.
pub(crate) struct LvmCmd {
    cmd: &'static str,
    args: Vec<String>,
}

/// Used to decode the json output for lvm commands, example
/// vgs --options=vg_size,vg_free --units=b --nosuffix --reportformat=json
///   {
///       "report": [
///           {
///               "vg": [
///                   {"vg_name": "pool", "vg_size":"15372124160",
/// "vg_free":"15372124160"}                ]
///           }
///       ]
///   }
#[derive(Debug, serde::Deserialize)]
struct LvReport<T> {
    report: Vec<T>,
}

impl LvmCmd {
    fn new(cmd: &'static str) -> Self {
        Self {
            cmd,
            args: Vec::new(),
        }
    }
    /// Prepare a `Command` for `LvmSubCmd::VGList`.
    pub(crate) fn vg_list() -> Self {
        Self::new(LvmSubCmd::VGList.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::LVList`.
    pub(crate) fn lv_list() -> Self {
        Self::new(LvmSubCmd::LVList.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::FullReport`.
    pub(crate) fn full_report() -> Self {
        Self::new(LvmSubCmd::FullReport.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::LVCreate`.
    pub(crate) fn lv_create() -> Self {
        Self::new(LvmSubCmd::LVCreate.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::LVChange`.
    pub(crate) fn lv_change() -> Self {
        Self::new(LvmSubCmd::LVChange.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::LVResize`.
    pub(crate) fn lv_resize() -> Self {
        Self::new(LvmSubCmd::LVResize.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::LVRemove`.
    pub(crate) fn lv_remove() -> Self {
        Self::new(LvmSubCmd::LVRemove.as_ref())
    }
    /// Prepare a `Command` for `LvmSubCmd::LVRename`.
    pub(crate) fn lv_rename() -> Self {
        Self::new(LvmSubCmd::LVRename.as_ref())
    }

    /// Append a single argument.
    pub(crate) fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }
    /// Append multiple arguments.
    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
    /// Append `--addtag <tag>` for every tag.
    pub(crate) fn tags(mut self, tags: &[String]) -> Self {
        for tag in tags {
            self.args.push("--addtag".to_string());
            self.args.push(tag.clone());
        }
        self
    }

    /// The full lvm argument vector, sub-command included.
    pub(crate) fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.cmd.to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Build the process to spawn, wrapped with nsenter when containerized.
    /// The locale is pinned so numeric formats and report text are stable.
    fn command(&self) -> Command {
        let argv = self.argv();
        let mut cmder = if containerized() {
            let mut cmder = Command::new(NSENTER);
            cmder.args(NSENTER_ARGS);
            cmder.arg(LVM);
            cmder.args(&argv);
            cmder
        } else {
            let mut cmder = Command::new(LVM);
            cmder.args(&argv);
            cmder
        };
        cmder
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmder
    }

    /// Runs the LVM command, streaming its stdout line by line to the log
    /// while the child executes.
    ///
    /// # Errors
    ///
    /// `Error::LvmBinSpawnErr` => Failed to execute or await for completion.
    /// `Error::LvmBinErr` => Completed with an exit code, stderr attached.
    pub(crate) async fn run(self) -> Result<(), Error> {
        let cmd = self.cmd;
        let (mut child, stdout_pipe, stderr_pipe) = self.spawn()?;

        let stdout_task = async {
            let mut lines = BufReader::new(stdout_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    info!("{line}");
                }
            }
        };
        let stderr_task = async {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr_pipe);
            reader.read_to_string(&mut buf).await.ok();
            buf
        };
        let ((), stderr) = tokio::join!(stdout_task, stderr_task);

        let status = child.wait().await.context(error::LvmBinSpawnErrSnafu {
            command: cmd.to_string(),
        })?;
        if !status.success() {
            return Err(Error::LvmBinErr {
                command: cmd.to_string(),
                error: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Runs the LVM command and returns every report entry of its json
    /// output. `fullreport` produces one entry per volume group.
    ///
    /// lvm writes the json report to stdout even when it exits non-zero
    /// (a missing volume group is exit code 5 with an empty report), so
    /// the decoded report takes precedence over the exit status: an empty
    /// report is returned as such for the caller to interpret, and the
    /// exit status is only consulted when the report is non-empty or
    /// cannot be decoded at all.
    ///
    /// # Errors
    ///
    /// `Error::LvmBinSpawnErr` => Failed to execute or await for completion.
    /// `Error::LvmBinErr` => Completed with an exit code and no empty report.
    /// `Error::JsonParsing` => StdOut output is not a valid json for `T`.
    pub(crate) async fn reports<T: DeserializeOwned>(self) -> Result<Vec<T>, Error> {
        let cmd = self.cmd;
        let output = self.collect_output().await?;
        decode_reports(cmd, output)
    }

    /// Spawn the process and collect its whole output. The child is reaped
    /// on every path: it is awaited before the output is inspected and
    /// `kill_on_drop` covers a caller cancelling mid-flight.
    async fn collect_output(self) -> Result<CmdOutput, Error> {
        let cmd = self.cmd;
        let (mut child, stdout_pipe, stderr_pipe) = self.spawn()?;

        // Drain both pipes concurrently so a full stderr buffer can not
        // stall a child still writing its report.
        let stdout_task = async {
            let mut buf = String::new();
            let mut reader = BufReader::new(stdout_pipe);
            reader.read_to_string(&mut buf).await.map(|_| buf)
        };
        let stderr_task = async {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr_pipe);
            reader.read_to_string(&mut buf).await.ok();
            buf
        };
        let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);

        let status = child.wait().await.context(error::LvmBinSpawnErrSnafu {
            command: cmd.to_string(),
        })?;
        let stdout = stdout.context(error::LvmBinSpawnErrSnafu {
            command: cmd.to_string(),
        })?;

        Ok(CmdOutput {
            stdout,
            stderr,
            success: status.success(),
        })
    }

    /// Spawn the child with both output pipes taken.
    #[allow(clippy::type_complexity)]
    fn spawn(
        self,
    ) -> Result<
        (
            tokio::process::Child,
            tokio::process::ChildStdout,
            tokio::process::ChildStderr,
        ),
        Error,
    > {
        trace!("invoking lvm {:?}", self.argv());

        let mut child = self.command().spawn().context(error::LvmBinSpawnErrSnafu {
            command: self.cmd.to_string(),
        })?;
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        Ok((child, stdout, stderr))
    }
}

/// Collected output of an awaited lvm invocation.
struct CmdOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

/// Interpret a finished report invocation, giving the decoded report
/// precedence over the exit status: an empty report means nothing
/// matched, even when lvm also exited non-zero. The exit status decides
/// only when the report is non-empty or undecodable.
fn decode_reports<T: DeserializeOwned>(cmd: &str, output: CmdOutput) -> Result<Vec<T>, Error> {
    match serde_json::from_str::<LvReport<T>>(&output.stdout) {
        Ok(decoded) if decoded.report.is_empty() => Ok(Vec::new()),
        Ok(decoded) => {
            if output.success {
                Ok(decoded.report)
            } else {
                Err(Error::LvmBinErr {
                    command: cmd.to_string(),
                    error: output.stderr.trim().to_string(),
                })
            }
        }
        Err(error) => {
            if output.success {
                Err(Error::JsonParsing {
                    command: cmd.to_string(),
                    error: error.to_string(),
                })
            } else {
                Err(Error::LvmBinErr {
                    command: cmd.to_string(),
                    error: output.stderr.trim().to_string(),
                })
            }
        }
    }
}

/// Serde deserializer helpers to help decode LVM json output from the cli.
pub(crate) mod de {
    use serde::de::{self, Deserialize, Deserializer, Visitor};
    use std::{fmt::Display, iter::FromIterator, marker::PhantomData, str::FromStr};

    /// Decode a number from a number as a string, example: "10".
    pub(crate) fn number_from_string<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        T::from_str(&s).map_err(de::Error::custom)
    }

    /// Decode an optional number from a string, where the empty string means
    /// the field is not set for this row.
    pub(crate) fn opt_number_from_string<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(None);
        }
        T::from_str(&s).map(Some).map_err(de::Error::custom)
    }

    /// Decode an optional string, where the empty string means unset.
    pub(crate) fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }

    /// Decode a comma-separated string into a vector of strings.
    pub(crate) fn comma_separated<'de, V, T, D>(deserializer: D) -> Result<V, D::Error>
    where
        V: FromIterator<T>,
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        struct CommaSeparated<V, T>(PhantomData<V>, PhantomData<T>);

        impl<'de, V, T> Visitor<'de> for CommaSeparated<V, T>
        where
            V: FromIterator<T>,
            T: FromStr,
            T::Err: Display,
        {
            type Value = V;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("string containing comma-separated elements")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let iter = s
                    .split(',')
                    .filter(|x| !x.is_empty())
                    .map(FromStr::from_str);
                Result::from_iter(iter).map_err(de::Error::custom)
            }
        }

        let visitor = CommaSeparated(PhantomData, PhantomData);
        deserializer.deserialize_str(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_includes_sub_command() {
        let cmd = LvmCmd::lv_create()
            .args(["-n", "v1"])
            .arg("-L")
            .arg("1073741824b")
            .args(["-W", "y", "-y"])
            .arg("vg0");
        assert_eq!(
            cmd.argv(),
            vec!["lvcreate", "-n", "v1", "-L", "1073741824b", "-W", "y", "-y", "vg0"]
        );
    }

    #[test]
    fn tags_expand_to_addtag_pairs() {
        let tags = vec!["a".to_string(), "b".to_string()];
        let cmd = LvmCmd::lv_create().args(["-n", "v1"]).tags(&tags);
        assert_eq!(
            cmd.argv(),
            vec!["lvcreate", "-n", "v1", "--addtag", "a", "--addtag", "b"]
        );
    }

    #[test]
    fn containerized_invocations_are_wrapped_with_nsenter() {
        let direct = LvmCmd::vg_list().command();
        assert_eq!(direct.as_std().get_program(), LVM);

        set_containerized(true);
        let wrapped = LvmCmd::vg_list().command();
        set_containerized(false);

        assert_eq!(wrapped.as_std().get_program(), NSENTER);
        let args: Vec<_> = wrapped
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-m", "-u", "-i", "-n", "-p", "-t", "1", LVM, "vgs"]);

        let env: Vec<_> = direct.as_std().get_envs().collect();
        assert!(env.iter().any(|(k, v)| {
            k.to_str() == Some("LC_ALL") && v.and_then(|v| v.to_str()) == Some("C")
        }));
    }

    #[test]
    fn report_json_decodes() {
        #[derive(Debug, serde::Deserialize)]
        struct Vgs {
            vg: Vec<serde_json::Value>,
        }
        let raw = r#"{"report":[{"vg":[{"vg_name":"pool"}]}]}"#;
        let decoded: LvReport<Vgs> = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.report.len(), 1);
        assert_eq!(decoded.report[0].vg.len(), 1);
    }

    fn output(stdout: &str, stderr: &str, success: bool) -> CmdOutput {
        CmdOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            success,
        }
    }

    #[test]
    fn empty_report_wins_over_exit_status() {
        // a missing volume group is exit code 5 with an empty report
        let rows: Vec<serde_json::Value> = decode_reports(
            "vgs",
            output(r#"{"report":[]}"#, "Volume group \"vg0\" not found", false),
        )
        .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn failures_with_a_populated_report_surface_stderr() {
        let result: Result<Vec<serde_json::Value>, _> = decode_reports(
            "vgs",
            output(r#"{"report":[{"vg":[]}]}"#, "metadata error", false),
        );
        assert!(matches!(
            result,
            Err(Error::LvmBinErr { error, .. }) if error == "metadata error"
        ));
    }

    #[test]
    fn undecodable_failures_surface_stderr() {
        let result: Result<Vec<serde_json::Value>, _> =
            decode_reports("vgs", output("", "cannot access lvm", false));
        assert!(matches!(
            result,
            Err(Error::LvmBinErr { error, .. }) if error == "cannot access lvm"
        ));
    }

    #[test]
    fn undecodable_successes_are_json_errors() {
        let result: Result<Vec<serde_json::Value>, _> =
            decode_reports("vgs", output("not json", "", true));
        assert!(matches!(result, Err(Error::JsonParsing { .. })));
    }
}
