use crate::lvm::{
    cli::{de, LvmCmd},
    error::{self, Error},
    lv::{self, LogicalVolume, LvEntry, ThinPool},
};

use serde::Deserialize;
use std::collections::HashMap;

/// The vgs report columns requested for every volume group query.
const VG_FIELDS: &str = "vg_uuid,vg_name,vg_size,vg_free";

/// Used to decode the json output for the vgs command to get the capacity
/// and free size of a given volume group
/// vgs --options=vg_uuid,vg_name,vg_size,vg_free --units=b --nosuffix
/// --reportformat=json
///   {
///       "report": [
///           {
///               "vg": [
///                   {"vg_name": "vg0", "vg_size":"15372124160",
/// "vg_free":"15372124160"}                ]
///           }
///       ]
///   }
#[derive(Debug, Deserialize)]
struct VgRows {
    #[serde(default)]
    vg: Vec<VgEntry>,
}

/// A single row of the vgs json report.
#[derive(Debug, Clone, Deserialize)]
struct VgEntry {
    #[serde(rename = "vg_name")]
    name: String,
    #[serde(rename = "vg_uuid")]
    uuid: String,
    #[serde(rename = "vg_size", deserialize_with = "de::number_from_string")]
    size: u64,
    #[serde(rename = "vg_free", deserialize_with = "de::number_from_string")]
    free: u64,
}

/// One entry of the fullreport output, carrying the vg row together with
/// the lv rows of every volume group.
#[derive(Debug, Deserialize)]
struct FullReportEntry {
    #[serde(default)]
    vg: Vec<VgEntry>,
    #[serde(default)]
    lv: Vec<LvEntry>,
}

/// An LVM volume group. Groups are provisioned by the operator and only
/// observed here; after any mutation the state is observed again rather
/// than updated in place.
#[derive(Debug, Clone)]
pub struct VolumeGroup {
    name: String,
    uuid: String,
    size: u64,
    free: u64,
    /// lv rows captured by a fullreport, so that listing volumes of this
    /// group does not have to invoke lvm again.
    report_lvs: Option<Vec<LvEntry>>,
}

impl VolumeGroup {
    fn from_entry(entry: VgEntry, report_lvs: Option<Vec<LvEntry>>) -> Self {
        Self {
            name: entry.name,
            uuid: entry.uuid,
            size: entry.size,
            free: entry.free,
            report_lvs,
        }
    }

    /// Find a named volume group.
    pub async fn find(name: &str) -> Result<Self, Error> {
        let args = [
            name,
            "-o",
            VG_FIELDS,
            "--units",
            "b",
            "--nosuffix",
            "--reportformat",
            "json",
        ];
        let reports: Vec<VgRows> = match LvmCmd::vg_list().args(args).reports().await {
            Ok(reports) => reports,
            // last resort, for failures whose report could not be decoded
            Err(Error::LvmBinErr { error, .. }) if error::is_not_found(&error) => {
                return Err(Error::VgNotFound {
                    name: name.to_string(),
                })
            }
            Err(error) => return Err(error),
        };
        // an empty report means nothing matched, whatever the exit status
        let Some(rows) = reports.into_iter().next() else {
            return Err(Error::VgNotFound {
                name: name.to_string(),
            });
        };
        rows.vg
            .into_iter()
            .find(|vg| vg.name == name)
            .map(|vg| Self::from_entry(vg, None))
            .ok_or_else(|| Error::VgNotFound {
                name: name.to_string(),
            })
    }

    /// List all volume groups together with their logical volumes through
    /// a single fullreport invocation, which is cheaper than calling vgs
    /// and lvs per group.
    pub async fn list() -> Result<Vec<Self>, Error> {
        let args = [
            "--units",
            "b",
            "--nosuffix",
            "--reportformat",
            "json",
            "--configreport",
            "vg",
            "-o",
            VG_FIELDS,
            "--configreport",
            "lv",
            "-o",
            lv::LV_FIELDS,
        ];
        let entries: Vec<FullReportEntry> = LvmCmd::full_report().args(args).reports().await?;

        let mut lvs = Vec::new();
        let mut vgs = Vec::new();
        for entry in entries {
            vgs.extend(entry.vg);
            lvs.extend(entry.lv);
        }

        Ok(vgs
            .into_iter()
            .map(|vg| {
                let report_lvs = lvs
                    .iter()
                    .filter(|lv| lv.vg_name == vg.name)
                    .cloned()
                    .collect();
                Self::from_entry(vg, Some(report_lvs))
            })
            .collect())
    }

    /// Search a listed set of volume groups for a name.
    pub fn search<'a>(vgs: &'a [VolumeGroup], name: &str) -> Result<&'a VolumeGroup, Error> {
        vgs.iter()
            .find(|vg| vg.name == name)
            .ok_or_else(|| Error::VgNotFound {
                name: name.to_string(),
            })
    }

    /// Get the volume group name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Get the volume group uuid.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
    /// Get the volume group capacity in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
    /// Get the volume group free space in bytes.
    pub fn free(&self) -> u64 {
        self.free
    }

    /// The lv rows of this group, from the fullreport capture when one is
    /// held, otherwise via lvs.
    async fn raw_lvs(&self, name: Option<&str>) -> Result<Vec<LvEntry>, Error> {
        if let Some(cached) = &self.report_lvs {
            return match name {
                Some(lv_name) => cached
                    .iter()
                    .find(|row| row.name == lv_name)
                    .map(|row| vec![row.clone()])
                    .ok_or_else(|| Error::LvNotFound {
                        name: format!("{}/{lv_name}", self.name),
                    }),
                None => Ok(cached.clone()),
            };
        }
        lv::query(&self.name, name).await
    }

    /// List all logical volumes of this group, keyed by name. Thin pools
    /// are not volumes and are excluded; they are surfaced by
    /// [`VolumeGroup::list_pools`] instead.
    pub async fn list_volumes(&self) -> Result<HashMap<String, LogicalVolume>, Error> {
        self.raw_lvs(None)
            .await?
            .iter()
            .filter(|row| !row.is_thin_pool())
            .map(|row| LogicalVolume::from_entry(row).map(|lv| (lv.name().to_string(), lv)))
            .collect()
    }

    /// Find a named logical volume in this group.
    pub async fn find_volume(&self, name: &str) -> Result<LogicalVolume, Error> {
        let rows = self.raw_lvs(Some(name)).await?;
        let row = rows
            .iter()
            .find(|row| row.name == name && !row.is_thin_pool())
            .ok_or_else(|| Error::LvNotFound {
                name: format!("{}/{name}", self.name),
            })?;
        LogicalVolume::from_entry(row)
    }

    /// List all thin pools of this group.
    pub async fn list_pools(&self) -> Result<Vec<ThinPool>, Error> {
        Ok(self
            .raw_lvs(None)
            .await?
            .iter()
            .filter(|row| row.is_thin_pool())
            .map(ThinPool::from_entry)
            .collect())
    }

    /// Find a named thin pool in this group.
    pub async fn find_pool(&self, name: &str) -> Result<ThinPool, Error> {
        let rows = self.raw_lvs(Some(name)).await.map_err(|error| match error {
            Error::LvNotFound { name } => Error::PoolNotFound { name },
            other => other,
        })?;
        rows.iter()
            .find(|row| row.name == name && row.is_thin_pool())
            .map(ThinPool::from_entry)
            .ok_or_else(|| Error::PoolNotFound {
                name: format!("{}/{name}", self.name),
            })
    }

    /// Create a logical volume in this volume group. `size` is in bytes
    /// and `lvcreate_options` are appended to the base creation command.
    pub async fn create_volume(
        &self,
        name: &str,
        size: u64,
        tags: &[String],
        stripe: u32,
        stripe_size: Option<&str>,
        lvcreate_options: &[String],
    ) -> Result<(), Error> {
        let cmd = lv::lvcreate_cmd(
            &self.name,
            name,
            size,
            tags,
            stripe,
            stripe_size,
            lvcreate_options,
        );
        match cmd.run().await {
            Err(Error::LvmBinErr { error, .. }) if lv::is_no_space(&error) => {
                Err(Error::NoSpace { error })
            }
            other => other,
        }
    }

    /// Create a pool for thin-provisioning volumes.
    pub async fn create_pool(&self, name: &str, size: u64) -> Result<ThinPool, Error> {
        LvmCmd::lv_create()
            .args([
                "-T",
                &format!("{}/{name}", self.name),
                "--size",
                &format!("{size}b"),
            ])
            .run()
            .await?;
        self.find_pool(name).await
    }
}
