use crate::lvm::{
    cli::{de, LvmCmd},
    error::{self, Error},
    lv_attr::LvAttr,
};

use serde::Deserialize;
use snafu::ensure;
use std::{collections::HashMap, path::PathBuf, str::FromStr};

/// The lvs report columns requested for every logical volume query.
pub(super) const LV_FIELDS: &str = "lv_uuid,lv_name,lv_full_name,lv_path,lv_size,\
lv_kernel_major,lv_kernel_minor,origin,origin_size,pool_lv,lv_tags,\
lv_attr,vg_name,data_percent,metadata_percent";

/// Used to decode the json output of the lvs command, where `lv` holds one
/// row per logical volume.
#[derive(Debug, Deserialize)]
pub(super) struct LvRows {
    #[serde(default)]
    pub(super) lv: Vec<LvEntry>,
}

/// A single row of the lvs json report. Numeric columns arrive as strings
/// and optional columns as empty strings.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LvEntry {
    #[serde(rename = "lv_name")]
    pub(super) name: String,
    #[serde(rename = "lv_full_name")]
    pub(super) full_name: String,
    #[serde(rename = "lv_path")]
    pub(super) path: String,
    #[serde(rename = "lv_size", deserialize_with = "de::number_from_string")]
    pub(super) size: u64,
    /// -1 while the volume is not active.
    #[serde(rename = "lv_kernel_major", deserialize_with = "de::number_from_string")]
    pub(super) major: i64,
    #[serde(rename = "lv_kernel_minor", deserialize_with = "de::number_from_string")]
    pub(super) minor: i64,
    #[serde(rename = "origin", deserialize_with = "de::empty_string_as_none")]
    pub(super) origin: Option<String>,
    #[serde(
        rename = "origin_size",
        default,
        deserialize_with = "de::opt_number_from_string"
    )]
    pub(super) origin_size: Option<u64>,
    #[serde(rename = "pool_lv", deserialize_with = "de::empty_string_as_none")]
    pub(super) pool: Option<String>,
    #[serde(rename = "lv_tags", deserialize_with = "de::comma_separated")]
    pub(super) tags: Vec<String>,
    #[serde(rename = "lv_attr")]
    pub(super) attr: String,
    #[serde(rename = "vg_name")]
    pub(super) vg_name: String,
    #[serde(
        rename = "data_percent",
        default,
        deserialize_with = "de::opt_number_from_string"
    )]
    pub(super) data_percent: Option<f64>,
    #[serde(
        rename = "metadata_percent",
        default,
        deserialize_with = "de::opt_number_from_string"
    )]
    pub(super) metadata_percent: Option<f64>,
}

impl LvEntry {
    /// Whether this row describes a thin pool, per its attribute byte.
    pub(super) fn is_thin_pool(&self) -> bool {
        LvAttr::from_str(&self.attr)
            .map(|attr| attr.volume_type == super::lv_attr::VolumeType::ThinPool)
            .unwrap_or(false)
    }
}

/// Query lvs rows for a volume group, or for a single named volume within
/// it. A named query which matches nothing is a `LvNotFound`.
pub(super) async fn query(vg_name: &str, lv_name: Option<&str>) -> Result<Vec<LvEntry>, Error> {
    let target = match lv_name {
        Some(lv) => format!("{vg_name}/{lv}"),
        None => vg_name.to_string(),
    };
    let args = [
        target.as_str(),
        "-o",
        LV_FIELDS,
        "--units",
        "b",
        "--nosuffix",
        "--reportformat",
        "json",
    ];
    let reports = match LvmCmd::lv_list().args(args).reports::<LvRows>().await {
        Ok(reports) => reports,
        // last resort, for failures whose report could not be decoded
        Err(Error::LvmBinErr { error, .. }) if error::is_not_found(&error) => {
            return Err(not_found(vg_name, lv_name, target));
        }
        Err(error) => return Err(error),
    };
    // an empty report means nothing matched, whatever the exit status
    let Some(rows) = reports.into_iter().next() else {
        return Err(not_found(vg_name, lv_name, target));
    };
    if rows.lv.is_empty() && lv_name.is_some() {
        return Err(Error::LvNotFound { name: target });
    }
    Ok(rows.lv)
}

/// The missing object of a query: the volume when one was named, the
/// whole group otherwise.
fn not_found(vg_name: &str, lv_name: Option<&str>, target: String) -> Error {
    match lv_name {
        Some(_) => Error::LvNotFound { name: target },
        None => Error::VgNotFound {
            name: vg_name.to_string(),
        },
    }
}

/// Access requested when activating a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    ReadOnly,
    ReadWrite,
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(access: &str) -> Result<Self, Self::Err> {
        match access {
            "ro" => Ok(Self::ReadOnly),
            "rw" => Ok(Self::ReadWrite),
            _ => Err(Error::UnknownAccessType {
                access: access.to_string(),
            }),
        }
    }
}

/// A logical volume of a volume group as observed by lvs.
#[derive(Debug, Clone)]
pub struct LogicalVolume {
    name: String,
    full_name: String,
    path: String,
    vg_name: String,
    size: u64,
    origin: Option<String>,
    pool: Option<String>,
    dev_major: u32,
    dev_minor: u32,
    tags: Vec<String>,
    attr: LvAttr,
}

impl LogicalVolume {
    pub(super) fn from_entry(entry: &LvEntry) -> Result<Self, Error> {
        let attr = LvAttr::from_str(&entry.attr)?;
        let size = match (&entry.origin, &entry.pool) {
            // a snapshot which is not thin reports the origin size, not
            // the size of its copy-on-write store
            (Some(_), None) => entry.origin_size.unwrap_or(entry.size),
            _ => entry.size,
        };
        Ok(Self {
            name: entry.name.clone(),
            full_name: entry.full_name.clone(),
            path: entry.path.clone(),
            vg_name: entry.vg_name.clone(),
            size,
            origin: entry.origin.clone(),
            pool: entry.pool.clone(),
            dev_major: entry.major.max(0) as u32,
            dev_minor: entry.minor.max(0) as u32,
            tags: entry.tags.clone(),
            attr,
        })
    }

    /// Get the volume name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Get the vg prefixed volume name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }
    /// Get the path to the block device.
    pub fn path(&self) -> &str {
        &self.path
    }
    /// Get the name of the owning volume group.
    pub fn vg_name(&self) -> &str {
        &self.vg_name
    }
    /// Get the size of the volume in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
    /// Get the origin volume name if this is a snapshot.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
    /// Get the thin pool name if this is a thin volume.
    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }
    /// Get the device major number, 0 while inactive.
    pub fn dev_major(&self) -> u32 {
        self.dev_major
    }
    /// Get the device minor number, 0 while inactive.
    pub fn dev_minor(&self) -> u32 {
        self.dev_minor
    }
    /// Get the volume tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
    /// Get the parsed attribute record.
    pub fn attr(&self) -> &LvAttr {
        &self.attr
    }
    /// Whether this volume is a snapshot of another volume.
    pub fn is_snapshot(&self) -> bool {
        self.origin.is_some()
    }
    /// Whether this volume is provisioned from a thin pool.
    pub fn is_thin(&self) -> bool {
        self.pool.is_some()
    }

    /// Take a thin snapshot of this volume. The volume must be thinly
    /// provisioned; thin snapshots can be created unconditionally.
    pub async fn thin_snapshot(&self, name: &str, tags: &[String]) -> Result<(), Error> {
        ensure!(
            self.is_thin(),
            error::SnapshotNonThinSnafu {
                name: self.full_name.clone(),
            }
        );
        thin_snapshot_cmd(&self.full_name, name, tags).run().await
    }

    /// Activate the volume for the desired access.
    pub async fn activate(&self, access: AccessType) -> Result<(), Error> {
        activate_cmd(&self.path, access).run().await
    }

    /// Resize this volume to `new_size` bytes. Shrinking is rejected
    /// before any command is issued and resizing to the current size is a
    /// no-op. The size is re-read afterwards as lvresize rounds it up to
    /// the extent size.
    pub async fn resize(&mut self, new_size: u64) -> Result<(), Error> {
        ensure!(
            new_size >= self.size,
            error::CannotShrinkSnafu {
                name: self.full_name.clone(),
                current: self.size,
                requested: new_size,
            }
        );
        if new_size == self.size {
            return Ok(());
        }
        LvmCmd::lv_resize()
            .args(["-L", &format!("{new_size}b"), &self.full_name])
            .run()
            .await?;

        let rows = query(&self.vg_name, Some(&self.name)).await?;
        if let Some(entry) = rows.iter().find(|row| row.name == self.name) {
            self.size = entry.size;
        }
        Ok(())
    }

    /// Remove this volume.
    pub async fn remove(self) -> Result<(), Error> {
        LvmCmd::lv_remove().args(["-f", &self.path]).run().await
    }

    /// Rename this volume, updating the name, full name and device path.
    pub async fn rename(&mut self, name: &str) -> Result<(), Error> {
        LvmCmd::lv_rename()
            .args([self.vg_name.as_str(), self.name.as_str(), name])
            .run()
            .await?;

        self.full_name = format!("{}/{}", self.vg_name, name);
        self.path = renamed_path(&self.path, name);
        self.name = name.to_string();
        Ok(())
    }
}

/// The device path after a rename: the directory stays put, only the
/// basename changes.
fn renamed_path(path: &str, name: &str) -> String {
    let mut path = PathBuf::from(path);
    path.set_file_name(name);
    path.to_string_lossy().into_owned()
}

pub(super) fn thin_snapshot_cmd(origin_full_name: &str, name: &str, tags: &[String]) -> LvmCmd {
    LvmCmd::lv_create()
        .args(["-s", "-k", "n", "-n", name, origin_full_name])
        .tags(tags)
}

pub(super) fn activate_cmd(path: &str, access: AccessType) -> LvmCmd {
    match access {
        AccessType::ReadOnly => LvmCmd::lv_change().args(["-p", "r", path]),
        AccessType::ReadWrite => LvmCmd::lv_change().args(["-k", "n", "-a", "y", path]),
    }
}

/// Current usage of a thin pool, synthesized from the pool row and its
/// member volumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinPoolUsage {
    pub data_percent: f64,
    pub metadata_percent: f64,
    pub virtual_bytes: u64,
    pub size_bytes: u64,
}

impl ThinPoolUsage {
    /// Free bytes advertised for this pool under the given overprovision
    /// ratio: floor(ratio x size) minus the sum of member virtual sizes,
    /// never below zero.
    pub fn free_bytes(&self, overprovision_ratio: f64) -> u64 {
        let virtual_capacity = (overprovision_ratio * self.size_bytes as f64) as u64;
        virtual_capacity.saturating_sub(self.virtual_bytes)
    }
}

/// A thin pool of a volume group.
#[derive(Debug, Clone)]
pub struct ThinPool {
    vg_name: String,
    name: String,
    full_name: String,
    size: u64,
    data_percent: f64,
    metadata_percent: f64,
}

impl ThinPool {
    pub(super) fn from_entry(entry: &LvEntry) -> Self {
        Self {
            vg_name: entry.vg_name.clone(),
            name: entry.name.clone(),
            full_name: entry.full_name.clone(),
            size: entry.size,
            data_percent: entry.data_percent.unwrap_or_default(),
            metadata_percent: entry.metadata_percent.unwrap_or_default(),
        }
    }

    /// Get the pool name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Get the vg prefixed pool name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }
    /// Get the physical size of the pool in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Create a thin volume provisioned from this pool. `size` is the
    /// virtual size in bytes.
    pub async fn create_volume(
        &self,
        name: &str,
        size: u64,
        tags: &[String],
        stripe: u32,
        stripe_size: Option<&str>,
        lvcreate_options: &[String],
    ) -> Result<(), Error> {
        let cmd = thin_lvcreate_cmd(
            &self.full_name,
            name,
            size,
            tags,
            stripe,
            stripe_size,
            lvcreate_options,
        );
        match cmd.run().await {
            Err(Error::LvmBinErr { error, .. }) if is_no_space(&error) => {
                Err(Error::NoSpace { error })
            }
            other => other,
        }
    }

    /// Resize the thin pool capacity. The size is re-read afterwards as
    /// lvresize rounds it up to the extent size.
    pub async fn resize(&mut self, new_size: u64) -> Result<(), Error> {
        if new_size == self.size {
            return Ok(());
        }
        LvmCmd::lv_resize()
            .args(["-f", "-L", &format!("{new_size}b"), &self.full_name])
            .run()
            .await?;

        let rows = query(&self.vg_name, Some(&self.name)).await?;
        if let Some(entry) = rows.iter().find(|row| row.name == self.name) {
            self.size = entry.size;
        }
        Ok(())
    }

    /// List the thin volumes provisioned from this pool. The members are
    /// re-read on every call; they mutate concurrently, including from
    /// actors other than this daemon.
    pub async fn list_volumes(&self) -> Result<HashMap<String, LogicalVolume>, Error> {
        let rows = query(&self.vg_name, None).await?;
        rows.iter()
            .filter(|row| !row.is_thin_pool() && row.pool.as_deref() == Some(self.name.as_str()))
            .map(|row| LogicalVolume::from_entry(row).map(|lv| (lv.name().to_string(), lv)))
            .collect()
    }

    /// Observe the current usage of this pool, member virtual sizes
    /// included.
    pub async fn usage(&self) -> Result<ThinPoolUsage, Error> {
        let members = self.list_volumes().await?;
        Ok(ThinPoolUsage {
            data_percent: self.data_percent,
            metadata_percent: self.metadata_percent,
            virtual_bytes: members.values().map(LogicalVolume::size).sum(),
            size_bytes: self.size,
        })
    }
}

pub(super) fn lvcreate_cmd(
    vg_name: &str,
    name: &str,
    size: u64,
    tags: &[String],
    stripe: u32,
    stripe_size: Option<&str>,
    lvcreate_options: &[String],
) -> LvmCmd {
    let mut cmd = LvmCmd::lv_create()
        .args(["-n", name, "-L", &format!("{size}b"), "-W", "y", "-y"])
        .tags(tags);
    if stripe != 0 {
        cmd = cmd.args(["-i", &stripe.to_string()]);
        if let Some(stripe_size) = stripe_size {
            cmd = cmd.args(["-I", stripe_size]);
        }
    }
    cmd.args(lvcreate_options.iter().cloned()).arg(vg_name)
}

pub(super) fn thin_lvcreate_cmd(
    pool_full_name: &str,
    name: &str,
    size: u64,
    tags: &[String],
    stripe: u32,
    stripe_size: Option<&str>,
    lvcreate_options: &[String],
) -> LvmCmd {
    let mut cmd = LvmCmd::lv_create()
        .args([
            "-T",
            pool_full_name,
            "-n",
            name,
            "-V",
            &format!("{size}b"),
            "-W",
            "y",
            "-y",
        ])
        .tags(tags);
    if stripe != 0 {
        cmd = cmd.args(["-i", &stripe.to_string()]);
        if let Some(stripe_size) = stripe_size {
            cmd = cmd.args(["-I", stripe_size]);
        }
    }
    cmd.args(lvcreate_options.iter().cloned())
}

/// lvcreate reports exhaustion only through its stderr text.
pub(super) fn is_no_space(stderr: &str) -> bool {
    stderr.contains("insufficient free space") || stderr.contains("out of data space")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LVS_JSON: &str = r#"
    {
        "report": [
            {
                "lv": [
                    {"lv_uuid":"aaa", "lv_name":"v1", "lv_full_name":"vg0/v1",
                     "lv_path":"/dev/vg0/v1", "lv_size":"1073741824",
                     "lv_kernel_major":"253", "lv_kernel_minor":"3",
                     "origin":"", "origin_size":"", "pool_lv":"",
                     "lv_tags":"one,two", "lv_attr":"-wi-a-----",
                     "vg_name":"vg0", "data_percent":"", "metadata_percent":""},
                    {"lv_uuid":"bbb", "lv_name":"pool0", "lv_full_name":"vg0/pool0",
                     "lv_path":"", "lv_size":"10737418240",
                     "lv_kernel_major":"-1", "lv_kernel_minor":"-1",
                     "origin":"", "origin_size":"", "pool_lv":"",
                     "lv_tags":"", "lv_attr":"twi-a-tz--",
                     "vg_name":"vg0", "data_percent":"12.50", "metadata_percent":"1.10"},
                    {"lv_uuid":"ccc", "lv_name":"snap", "lv_full_name":"vg0/snap",
                     "lv_path":"/dev/vg0/snap", "lv_size":"4194304",
                     "lv_kernel_major":"253", "lv_kernel_minor":"5",
                     "origin":"v1", "origin_size":"1073741824", "pool_lv":"",
                     "lv_tags":"", "lv_attr":"swi-a-s---",
                     "vg_name":"vg0", "data_percent":"", "metadata_percent":""}
                ]
            }
        ]
    }"#;

    fn rows() -> Vec<LvEntry> {
        #[derive(Debug, serde::Deserialize)]
        struct Report {
            report: Vec<LvRows>,
        }
        let report: Report = serde_json::from_str(LVS_JSON).unwrap();
        report.report.into_iter().next().unwrap().lv
    }

    #[test]
    fn decodes_lvs_rows() {
        let rows = rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].size, 1 << 30);
        assert_eq!(rows[0].tags, vec!["one", "two"]);
        assert_eq!(rows[0].origin, None);
        assert_eq!(rows[0].pool, None);
        assert_eq!(rows[1].major, -1);
        assert_eq!(rows[1].data_percent, Some(12.5));
        assert!(rows[1].is_thin_pool());
        assert!(!rows[0].is_thin_pool());
    }

    #[test]
    fn inactive_volume_has_zeroed_device_numbers() {
        let rows = rows();
        let pool_row = &rows[1];
        assert_eq!(pool_row.major, -1);
        // pools are never surfaced as volumes but the same conversion
        // applies to any inactive row
        let lv = LogicalVolume::from_entry(pool_row).unwrap();
        assert_eq!(lv.dev_major(), 0);
        assert_eq!(lv.dev_minor(), 0);
    }

    #[test]
    fn non_thin_snapshot_reports_origin_size() {
        let rows = rows();
        let snap = LogicalVolume::from_entry(&rows[2]).unwrap();
        assert!(snap.is_snapshot());
        assert!(!snap.is_thin());
        assert_eq!(snap.size(), 1 << 30);
    }

    #[test]
    fn thick_lvcreate_arguments() {
        let cmd = lvcreate_cmd("vg0", "v1", 1073741824, &[], 0, None, &[]);
        assert_eq!(
            cmd.argv(),
            vec!["lvcreate", "-n", "v1", "-L", "1073741824b", "-W", "y", "-y", "vg0"]
        );
    }

    #[test]
    fn thick_lvcreate_with_stripes_tags_and_options() {
        let tags = vec!["tag1".to_string()];
        let options = vec!["--wipesignatures".to_string(), "n".to_string()];
        let cmd = lvcreate_cmd("vg0", "v1", 4096, &tags, 2, Some("64k"), &options);
        assert_eq!(
            cmd.argv(),
            vec![
                "lvcreate",
                "-n",
                "v1",
                "-L",
                "4096b",
                "-W",
                "y",
                "-y",
                "--addtag",
                "tag1",
                "-i",
                "2",
                "-I",
                "64k",
                "--wipesignatures",
                "n",
                "vg0"
            ]
        );
    }

    #[test]
    fn thin_lvcreate_arguments() {
        let cmd = thin_lvcreate_cmd("vg0/pool0", "v1", 21474836480, &[], 0, None, &[]);
        assert_eq!(
            cmd.argv(),
            vec!["lvcreate", "-T", "vg0/pool0", "-n", "v1", "-V", "21474836480b", "-W", "y", "-y"]
        );
    }

    #[test]
    fn thin_snapshot_arguments() {
        let cmd = thin_snapshot_cmd("vg0/src", "snap", &[]);
        assert_eq!(
            cmd.argv(),
            vec!["lvcreate", "-s", "-k", "n", "-n", "snap", "vg0/src"]
        );
    }

    #[test]
    fn activation_arguments() {
        assert_eq!(
            activate_cmd("/dev/vg0/snap", AccessType::ReadWrite).argv(),
            vec!["lvchange", "-k", "n", "-a", "y", "/dev/vg0/snap"]
        );
        assert_eq!(
            activate_cmd("/dev/vg0/snap", AccessType::ReadOnly).argv(),
            vec!["lvchange", "-p", "r", "/dev/vg0/snap"]
        );
    }

    #[test]
    fn access_type_parsing() {
        assert_eq!("ro".parse::<AccessType>().unwrap(), AccessType::ReadOnly);
        assert_eq!("rw".parse::<AccessType>().unwrap(), AccessType::ReadWrite);
        assert!(matches!(
            "rx".parse::<AccessType>(),
            Err(Error::UnknownAccessType { .. })
        ));
    }

    #[test]
    fn rename_rewrites_only_the_basename() {
        assert_eq!(renamed_path("/dev/vg0/old", "new"), "/dev/vg0/new");
        assert_eq!(renamed_path("old", "new"), "new");
    }

    #[test]
    fn thin_pool_usage_free_bytes() {
        let usage = ThinPoolUsage {
            data_percent: 50.0,
            metadata_percent: 1.0,
            virtual_bytes: 5 << 30,
            size_bytes: 10 << 30,
        };
        // 10 GiB x 10.0 - 5 GiB
        assert_eq!(usage.free_bytes(10.0), (100 << 30) - (5 << 30));
        // saturates at zero when overcommitted beyond the ratio
        assert_eq!(usage.free_bytes(0.25), 0);
    }
}
