//! SMART health reporting. Drive access sits behind a provider trait; the
//! real provider shells out to `smartctl` from a blocking task, tests plug
//! in a canned one.

use anyhow::{Context, Result};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::session::Request;

use super::Ctx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartAttr {
    pub id: u8,
    pub value: u64,
    pub raw: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SmartData {
    pub supported: bool,
    pub enabled: bool,
    pub attrs: Vec<SmartAttr>,
}

/// Per-device SMART access. `query` may block; callers run it off the
/// async threads.
pub trait SmartProvider {
    fn query(&self, device: &str) -> Result<SmartData>;
}

/// Provider backed by the smartmontools CLI.
pub struct SmartctlProvider {
    /// Issue `smartctl -s on` before reading, per configuration.
    pub enable_first: bool,
}

impl SmartctlProvider {
    fn run(args: &[&str]) -> Result<String> {
        let output = std::process::Command::new("smartctl")
            .args(args)
            .output()
            .context("running smartctl")?;
        // smartctl uses nonzero exit bits for drive conditions; the output
        // is still parseable, so only a failed spawn is fatal.
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SmartProvider for SmartctlProvider {
    fn query(&self, device: &str) -> Result<SmartData> {
        if self.enable_first {
            if let Err(e) = Self::run(&["-s", "on", device]) {
                warn!(device, error = %e, "can't enable SMART");
            }
        }

        let info = Self::run(&["-i", device])?;
        let mut data = parse_smartctl_info(&info);
        if data.enabled {
            let table = Self::run(&["-A", device])?;
            data.attrs = parse_smartctl_attrs(&table);
        }
        Ok(data)
    }
}

/// Emit SMART lines for every configured device. The supported/enabled
/// pair always goes out when the device answers; attribute lines need the
/// drive enabled and the attribute requested.
pub async fn report(ctx: &Ctx, req: &Request) {
    for device in ctx.cfg.smart_devices.clone() {
        let provider = ctx.smart.clone();
        let dev = device.clone();
        let queried = timeout(
            ctx.cfg.limits.target_timeout,
            tokio::task::spawn_blocking(move || provider.query(&dev)),
        )
        .await;

        let data = match queried {
            Ok(Ok(Ok(data))) => data,
            Ok(Ok(Err(e))) => {
                warn!(device, error = %e, "SMART query failed");
                continue;
            }
            Ok(Err(e)) => {
                warn!(device, error = %e, "SMART worker panicked");
                continue;
            }
            Err(_) => {
                warn!(device, "SMART query timed out");
                continue;
            }
        };

        let inst = device_instance(&device);
        let now = ctx.clock.now();
        ctx.out
            .metric_inst(now, "smart_supported", inst, u8::from(data.supported))
            .await;
        ctx.out
            .metric_inst(now, "smart_enabled", inst, u8::from(data.enabled))
            .await;

        if !data.enabled {
            continue;
        }
        for attr in &data.attrs {
            if !req.wants_attr(attr.id) {
                continue;
            }
            ctx.out
                .metric_inst(now, &format!("smart_{}_value", attr.id), inst, attr.value)
                .await;
            ctx.out
                .metric_inst(now, &format!("smart_{}_raw", attr.id), inst, attr.raw)
                .await;
        }
        if ctx.debug >= 1 {
            debug!(device, attrs = data.attrs.len(), "SMART attributes read");
        }
    }
}

/// `/dev/sda` reports as `sda`.
fn device_instance(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

/// Support/enabled flags from `smartctl -i` output.
pub fn parse_smartctl_info(output: &str) -> SmartData {
    let mut data = SmartData::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "SMART support is" {
            continue;
        }
        let value = value.trim();
        if value.starts_with("Available") {
            data.supported = true;
        } else if value.starts_with("Enabled") {
            data.enabled = true;
            data.supported = true;
        } else if value.starts_with("Disabled") {
            data.enabled = false;
        }
    }
    data
}

/// Attribute rows from the `smartctl -A` vendor attribute table:
/// `ID# ATTRIBUTE_NAME FLAG VALUE WORST THRESH TYPE UPDATED WHEN_FAILED RAW_VALUE`.
pub fn parse_smartctl_attrs(output: &str) -> Vec<SmartAttr> {
    let mut attrs = Vec::new();
    let mut in_table = false;
    for line in output.lines() {
        if line.trim_start().starts_with("ID#") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Ok(id) = fields[0].parse::<u8>() else {
            continue;
        };
        let Ok(value) = fields[3].parse::<u64>() else {
            continue;
        };
        // Raw values can carry a suffix ("29 (Min/Max 19/45)"); the leading
        // number is the counter.
        let raw = leading_number(fields[9]);
        attrs.push(SmartAttr { id, value, raw });
    }
    attrs
}

fn leading_number(field: &str) -> u64 {
    let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_ENABLED: &str = "\
Model Family:     Seagate Barracuda
Device Model:     ST31000528AS
SMART support is: Available - device has SMART capability.
SMART support is: Enabled
";

    const INFO_DISABLED: &str = "\
Device Model:     QEMU HARDDISK
SMART support is: Available - device has SMART capability.
SMART support is: Disabled
";

    const ATTR_TABLE: &str = "\
=== START OF READ SMART DATA SECTION ===
SMART Attributes Data Structure revision number: 10
Vendor Specific SMART Attributes with Thresholds:
ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  1 Raw_Read_Error_Rate     0x000f   117   099   006    Pre-fail  Always       -       149095678
  5 Reallocated_Sector_Ct   0x0033   100   100   036    Pre-fail  Always       -       0
190 Airflow_Temperature_Cel 0x0022   071   059   045    Old_age   Always       -       29 (Min/Max 19/45)
194 Temperature_Celsius     0x0022   029   041   000    Old_age   Always       -       29 (0 14 0 0 0)
";

    #[test]
    fn test_parse_info_enabled() {
        let d = parse_smartctl_info(INFO_ENABLED);
        assert!(d.supported);
        assert!(d.enabled);
    }

    #[test]
    fn test_parse_info_disabled() {
        let d = parse_smartctl_info(INFO_DISABLED);
        assert!(d.supported);
        assert!(!d.enabled);
    }

    #[test]
    fn test_parse_info_unsupported_device() {
        let d = parse_smartctl_info("Device Model: floppy\n");
        assert!(!d.supported);
        assert!(!d.enabled);
    }

    #[test]
    fn test_parse_attr_table() {
        let attrs = parse_smartctl_attrs(ATTR_TABLE);
        assert_eq!(attrs.len(), 4);
        assert_eq!(
            attrs[0],
            SmartAttr {
                id: 1,
                value: 117,
                raw: 149_095_678
            }
        );
        assert_eq!(attrs[1], SmartAttr { id: 5, value: 100, raw: 0 });
        // Parenthesized raw suffixes are dropped.
        assert_eq!(
            attrs[2],
            SmartAttr {
                id: 190,
                value: 71,
                raw: 29
            }
        );
    }

    #[test]
    fn test_parse_attr_table_ignores_preamble() {
        assert!(parse_smartctl_attrs("smartctl 7.2\nno table here\n").is_empty());
    }

    #[test]
    fn test_device_instance_strips_path() {
        assert_eq!(device_instance("/dev/sda"), "sda");
        assert_eq!(device_instance("nvme0n1"), "nvme0n1");
    }
}
