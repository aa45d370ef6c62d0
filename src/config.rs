//! Configuration surface for the DAQ core.
//!
//! Settings are loaded via [`figment`], layering a TOML file under an environment-variable
//! override (`APDCAM_` prefix), mirroring the layering approach used elsewhere in this
//! codebase's configuration system. `Settings::load` and `Settings::validate` are kept
//! separate so callers (and tests) can validate a `Settings` value built directly in code
//! without touching the filesystem or environment.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};

fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Top-level configuration, covering every field in the recognized configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Network MTU in bytes; drives the derived `octet` and maximum UDP packet size.
    pub mtu: u32,
    /// Whether ports are doubly spaced (`base + 2*i`) instead of consecutive (`base + i`).
    pub dual_sata: bool,
    /// Base UDP port; board `i`'s port is `udp_base_port + (dual_sata ? 2*i : i)`.
    pub udp_base_port: u16,
    /// Per-board, per-chip, per-channel-in-chip enable mask.
    pub channel_masks: Vec<Vec<Vec<bool>>>,
    /// Per-board resolution in bits (8..=14).
    pub resolution_bits: Vec<u32>,
    /// Selects which stream-header layout the socket reader parses.
    pub fw_version: FirmwareVersion,
    /// Network ring-buffer size in UDP packets (power of two).
    pub network_buffer_size: usize,
    /// Per-channel ring-buffer size in samples (power of two).
    pub channel_buffer_size: usize,
    /// Flatten-slack reserved past `channel_buffer_size` for wrapped range reads.
    pub channel_buffer_extra_size: usize,
    /// Nominal number of new shots the scheduler waits for before invoking processors.
    pub process_period: usize,
    /// Disk-dump: write every `diskdump_sampling`-th shot.
    pub diskdump_sampling: u32,
    /// Disk-dump: output directory for per-channel files.
    pub diskdump_output_dir: String,
    /// Disk-dump: filename pattern; `%` is replaced with the absolute channel number.
    pub diskdump_filename_pattern: String,
    /// Logging verbosity passed to `tracing_subscriber`'s `EnvFilter`.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mtu: 9000,
            dual_sata: false,
            udp_base_port: 10000,
            channel_masks: Vec::new(),
            resolution_bits: Vec::new(),
            fw_version: FirmwareVersion::V2,
            network_buffer_size: 1024,
            channel_buffer_size: 262_144,
            channel_buffer_extra_size: 256,
            process_period: 128,
            diskdump_sampling: 1,
            diskdump_output_dir: ".".to_string(),
            diskdump_filename_pattern: "channel_data_%.dat".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Selects the stream-header layout parsed by the UDP ingest socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareVersion {
    V1,
    V2,
}

impl Settings {
    /// Load settings from `path`, overridable by `APDCAM_*` environment variables, then
    /// validate the result.
    pub fn load(path: &str) -> DaqResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("APDCAM_").split("_"))
            .extract()
            .map_err(|e| DaqError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration-class invariants from the error taxonomy's `Configuration`
    /// category: power-of-two buffer sizes, a sane MTU, and length agreement between
    /// `channel_masks` and `resolution_bits`.
    pub fn validate(&self) -> DaqResult<()> {
        if self.mtu < 576 || self.mtu > 9216 {
            return Err(DaqError::Configuration(format!(
                "mtu {} outside plausible range 576..=9216",
                self.mtu
            )));
        }
        for (name, value) in [
            ("network_buffer_size", self.network_buffer_size),
            ("channel_buffer_size", self.channel_buffer_size),
            ("process_period", self.process_period),
        ] {
            if !is_power_of_two(value) {
                return Err(DaqError::Configuration(format!(
                    "{name} ({value}) must be a nonzero power of two"
                )));
            }
        }
        if self.channel_masks.len() != self.resolution_bits.len() {
            return Err(DaqError::Configuration(format!(
                "channel_masks has {} boards but resolution_bits has {}",
                self.channel_masks.len(),
                self.resolution_bits.len()
            )));
        }
        if self.diskdump_sampling == 0 {
            return Err(DaqError::Configuration(
                "diskdump_sampling must be at least 1".to_string(),
            ));
        }
        if !self.diskdump_filename_pattern.contains('%') {
            return Err(DaqError::Configuration(
                "diskdump_filename_pattern must contain a '%' placeholder".to_string(),
            ));
        }
        Ok(())
    }

    /// The derived maximum ADC payload per UDP datagram, in bytes: `octet * 8` where
    /// `octet = (mtu - 20 - 8 - 22) / 8`.
    pub fn max_adc_payload(&self) -> usize {
        let octet = (self.mtu as i64 - 20 - 8 - 22) / 8;
        (octet.max(0) as usize) * 8
    }

    /// The derived maximum UDP datagram size, header included.
    pub fn max_udp_packet_size(&self) -> usize {
        self.max_adc_payload() + 22
    }

    /// The UDP port for board `i`.
    pub fn port_for_board(&self, board: usize) -> u16 {
        self.udp_base_port + if self.dual_sata { (2 * board) as u16 } else { board as u16 }
    }
}
