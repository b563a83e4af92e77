//! Optical scan capability
//!
//! Decoding is delegated to an external decoder process (zbarcam style). The
//! process is started per scan, opens the camera, and prints one
//! `SYMBOLOGY:value` line per decoded code before exiting.

use crate::domain::error::CapabilityError;
use crate::domain::types::Symbology;
use crate::infra::config::Config;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable carrying the requested formats to the decoder
pub const FORMATS_ENV: &str = "SCAN_RELAY_FORMATS";

/// One decoded code as reported by the capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBarcode {
    pub raw_value: String,
    pub format: Option<Symbology>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResults {
    /// Zero or more codes, in decoder order
    Decoded(Vec<DecodedBarcode>),
    /// The operator backed out of the scan
    Cancelled,
}

/// Camera-backed decoder as seen by the capture source
#[async_trait]
pub trait ScanCapability: Send + Sync {
    /// Ask for camera access. Returns whether it was granted.
    async fn request_permissions(&self) -> bool;

    async fn scan(&self, formats: &[Symbology]) -> Result<ScanResults, CapabilityError>;
}

#[derive(Debug, Clone)]
pub struct ProcessScannerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub camera_device: PathBuf,
    pub cancel_exit_code: Option<i32>,
    pub timeout: Duration,
}

/// Runs the configured decoder command for each scan
pub struct ProcessScanner {
    config: ProcessScannerConfig,
}

impl ProcessScanner {
    pub fn new(config: ProcessScannerConfig) -> Self {
        Self { config }
    }

    /// Build from app config; `None` when no decoder command is configured
    pub fn from_config(config: &Config) -> Option<Self> {
        let command = config.scanner_command()?;
        Some(Self::new(ProcessScannerConfig {
            command: command.to_string(),
            args: config.scanner_args().to_vec(),
            camera_device: PathBuf::from(config.camera_device()),
            cancel_exit_code: config.scanner_cancel_exit_code(),
            timeout: Duration::from_millis(config.scan_timeout_ms()),
        }))
    }
}

#[async_trait]
impl ScanCapability for ProcessScanner {
    async fn request_permissions(&self) -> bool {
        // Camera access on a host is the right to open the device node
        match tokio::fs::File::open(&self.config.camera_device).await {
            Ok(_) => {
                debug!(device = %self.config.camera_device.display(), "camera_access_granted");
                true
            }
            Err(e) => {
                warn!(
                    device = %self.config.camera_device.display(),
                    error = %e,
                    "camera_access_denied"
                );
                false
            }
        }
    }

    async fn scan(&self, formats: &[Symbology]) -> Result<ScanResults, CapabilityError> {
        let format_list = formats.iter().map(Symbology::as_str).collect::<Vec<_>>().join(",");

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env(FORMATS_ENV, &format_list)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(command = %self.config.command, formats = %format_list, "scanner_started");

        let output = match tokio::time::timeout(self.config.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(CapabilityError(format!("failed to start decoder: {e}"))),
            Err(_) => {
                return Err(CapabilityError(format!(
                    "decoder timed out after {} ms",
                    self.config.timeout.as_millis()
                )))
            }
        };

        if let (Some(cancel), Some(code)) = (self.config.cancel_exit_code, output.status.code()) {
            if cancel == code {
                info!("scanner_cancelled");
                return Ok(ScanResults::Cancelled);
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CapabilityError(format!(
                "decoder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let decoded = parse_decoder_output(&stdout, formats);
        debug!(count = decoded.len(), "scanner_finished");
        Ok(ScanResults::Decoded(decoded))
    }
}

/// Parse decoder stdout into codes, keeping only the requested formats.
///
/// Lines look like `QR-Code:https://x` or `EAN-13:5901234123457`. A line whose
/// prefix is not a known symbology is taken whole as an unlabelled value.
pub fn parse_decoder_output(stdout: &str, formats: &[Symbology]) -> Vec<DecodedBarcode> {
    stdout
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let labelled = line
                .split_once(':')
                .and_then(|(label, value)| Symbology::from_label(label).map(|f| (f, value)));
            match labelled {
                Some((format, value)) if formats.contains(&format) => {
                    Some(DecodedBarcode { raw_value: value.to_string(), format: Some(format) })
                }
                Some(_) => None,
                None => Some(DecodedBarcode { raw_value: line.to_string(), format: None }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labelled_lines() {
        let out = "QR-Code:https://example.com/p/1\nEAN-13:5901234123457\n";
        let codes = parse_decoder_output(out, &Symbology::DEFAULT_SET);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].raw_value, "https://example.com/p/1");
        assert_eq!(codes[0].format, Some(Symbology::QrCode));
        assert_eq!(codes[1].raw_value, "5901234123457");
        assert_eq!(codes[1].format, Some(Symbology::Ean13));
    }

    #[test]
    fn test_parse_skips_unrequested_formats() {
        let out = "CODE-128:ABC-1\r\nEAN-13:5901234123457\r\n";
        let codes = parse_decoder_output(out, &[Symbology::Ean13]);
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].raw_value, "5901234123457");
    }

    #[test]
    fn test_parse_unlabelled_value() {
        let codes = parse_decoder_output("http://x/y\n", &Symbology::DEFAULT_SET);
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].raw_value, "http://x/y");
        assert_eq!(codes[0].format, None);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_decoder_output("", &Symbology::DEFAULT_SET).is_empty());
        assert!(parse_decoder_output("\n  \n", &Symbology::DEFAULT_SET).is_empty());
    }

    #[test]
    fn test_from_config_requires_command() {
        assert!(ProcessScanner::from_config(&Config::default()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_camera_denies_permission() {
        let scanner = ProcessScanner::new(ProcessScannerConfig {
            command: "true".to_string(),
            args: Vec::new(),
            camera_device: PathBuf::from("/nonexistent/video9"),
            cancel_exit_code: None,
            timeout: Duration::from_secs(5),
        });
        assert!(!scanner.request_permissions().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_output_is_decoded() {
        let scanner = ProcessScanner::new(ProcessScannerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo EAN-13:5901234123457".to_string()],
            camera_device: PathBuf::from("/dev/null"),
            cancel_exit_code: Some(3),
            timeout: Duration::from_secs(5),
        });
        let results = scanner.scan(&Symbology::DEFAULT_SET).await.unwrap();
        assert_eq!(
            results,
            ScanResults::Decoded(vec![DecodedBarcode {
                raw_value: "5901234123457".to_string(),
                format: Some(Symbology::Ean13),
            }])
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_exit_code() {
        let scanner = ProcessScanner::new(ProcessScannerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            camera_device: PathBuf::from("/dev/null"),
            cancel_exit_code: Some(3),
            timeout: Duration::from_secs(5),
        });
        assert_eq!(scanner.scan(&Symbology::DEFAULT_SET).await.unwrap(), ScanResults::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_decoder_is_an_error() {
        let scanner = ProcessScanner::new(ProcessScannerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo camera busy >&2; exit 1".to_string()],
            camera_device: PathBuf::from("/dev/null"),
            cancel_exit_code: Some(3),
            timeout: Duration::from_secs(5),
        });
        let err = scanner.scan(&Symbology::DEFAULT_SET).await.unwrap_err();
        assert!(err.0.contains("camera busy"));
    }
}
