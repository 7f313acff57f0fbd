//! Foreground traffic generation with `iperf3`.

use std::fmt;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExperimentError, Result};
use crate::exec::Invocation;

pub const DEFAULT_PORT: u16 = 5201;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(20);
pub const DEFAULT_UDP_BITRATE: &str = "10M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficRequest {
    pub target: IpAddr,
    pub port: u16,
    pub transport: Transport,
    #[serde(with = "crate::impairment::duration_ms")]
    pub duration: Duration,
    /// Offered load, UDP only.
    pub bitrate: Option<String>,
}

/// What the generator reported for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficReport {
    pub exit_code: Option<i32>,
    pub bytes_transferred: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u64>,
    /// Error string from the tool's own report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The tool's stdout, persisted next to the capture.
    #[serde(skip)]
    pub raw: String,
}

impl TrafficReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none() && self.bytes_transferred > 0
    }

    /// Why `succeeded` is false.
    pub fn failure_reason(&self) -> String {
        if let Some(err) = &self.error {
            return err.clone();
        }
        match self.exit_code {
            Some(0) => "no data transferred".to_string(),
            Some(code) => format!("traffic generator exited with status {code}"),
            None => "traffic generator killed by a signal".to_string(),
        }
    }
}

#[async_trait]
pub trait TrafficGenerator: Send + Sync {
    /// The exact client command, used for dry-run output.
    fn client_invocation(&self, request: &TrafficRequest) -> Invocation;

    /// Run the client to completion. Dropping the future kills the client.
    async fn run(&self, request: &TrafficRequest) -> Result<TrafficReport>;
}

#[derive(Debug, Clone)]
pub struct Iperf3 {
    pub program: String,
}

impl Default for Iperf3 {
    fn default() -> Self {
        Self {
            program: "iperf3".to_string(),
        }
    }
}

impl Iperf3 {
    pub fn server_invocation(&self, port: u16) -> Invocation {
        Invocation::new(&self.program).args(["-s".to_string(), "-p".to_string(), port.to_string()])
    }
}

#[async_trait]
impl TrafficGenerator for Iperf3 {
    fn client_invocation(&self, request: &TrafficRequest) -> Invocation {
        let mut inv = Invocation::new(&self.program).args([
            "-c".to_string(),
            request.target.to_string(),
            "-p".to_string(),
            request.port.to_string(),
            "-t".to_string(),
            request.duration.as_secs().max(1).to_string(),
            "-J".to_string(),
        ]);
        if request.transport == Transport::Udp {
            inv = inv.arg("-u");
            if let Some(bitrate) = &request.bitrate {
                inv = inv.args(["-b", bitrate.as_str()]);
            }
        }
        inv
    }

    async fn run(&self, request: &TrafficRequest) -> Result<TrafficReport> {
        let inv = self.client_invocation(request);
        debug!(command = %inv, "starting traffic");
        let mut cmd = inv.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        let output = cmd.output().await.map_err(|source| ExperimentError::Spawn {
            program: inv.program.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let exit_code = output.status.code();
        parse_report(exit_code, &stdout).or_else(|err| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                Err(err)
            } else {
                Err(ExperimentError::Traffic(stderr.trim().to_string()))
            }
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct JsonReport {
    error: Option<String>,
    #[serde(default)]
    end: JsonEnd,
}

#[derive(Debug, Default, Deserialize)]
struct JsonEnd {
    sum_sent: Option<JsonSum>,
    sum_received: Option<JsonSum>,
    sum: Option<JsonSum>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct JsonSum {
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    bits_per_second: f64,
    retransmits: Option<u64>,
    lost_percent: Option<f64>,
}

/// Read an `iperf3 -J` report.
///
/// TCP reports carry `sum_sent`/`sum_received`; UDP reports carry `sum`.
pub fn parse_report(exit_code: Option<i32>, stdout: &str) -> Result<TrafficReport> {
    let json: JsonReport = serde_json::from_str(stdout).map_err(|err| {
        ExperimentError::Traffic(format!(
            "unreadable traffic report ({err}), exit status {exit_code:?}"
        ))
    })?;

    let received = json.end.sum_received.or(json.end.sum);
    let sent = json.end.sum_sent.or(json.end.sum);
    let primary = received.or(sent).unwrap_or_default();

    Ok(TrafficReport {
        exit_code,
        bytes_transferred: primary.bytes,
        bits_per_second: primary.bits_per_second,
        lost_percent: json.end.sum.and_then(|s| s.lost_percent),
        retransmits: sent.and_then(|s| s.retransmits),
        error: json.error,
        raw: stdout.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_REPORT: &str = r#"{
        "start": {},
        "intervals": [],
        "end": {
            "sum_sent": {"bytes": 2621440, "bits_per_second": 1048576.0, "retransmits": 7},
            "sum_received": {"bytes": 2600000, "bits_per_second": 1040000.0}
        }
    }"#;

    const UDP_REPORT: &str = r#"{
        "end": {
            "sum": {
                "bytes": 1310720,
                "bits_per_second": 10000000.0,
                "lost_percent": 1.25,
                "jitter_ms": 0.1
            }
        }
    }"#;

    fn request(transport: Transport) -> TrafficRequest {
        TrafficRequest {
            target: "10.0.0.2".parse().unwrap(),
            port: 5201,
            transport,
            duration: Duration::from_secs(20),
            bitrate: Some("10M".into()),
        }
    }

    #[test]
    fn test_client_invocation_tcp_ignores_bitrate() {
        let inv = Iperf3::default().client_invocation(&request(Transport::Tcp));
        assert_eq!(inv.to_string(), "iperf3 -c 10.0.0.2 -p 5201 -t 20 -J");
    }

    #[test]
    fn test_client_invocation_udp() {
        let inv = Iperf3::default().client_invocation(&request(Transport::Udp));
        assert_eq!(inv.to_string(), "iperf3 -c 10.0.0.2 -p 5201 -t 20 -J -u -b 10M");
    }

    #[test]
    fn test_parse_tcp_report() {
        let report = parse_report(Some(0), TCP_REPORT).unwrap();
        assert_eq!(report.bytes_transferred, 2600000);
        assert_eq!(report.retransmits, Some(7));
        assert_eq!(report.lost_percent, None);
        assert!(report.succeeded());
    }

    #[test]
    fn test_parse_udp_report() {
        let report = parse_report(Some(0), UDP_REPORT).unwrap();
        assert_eq!(report.bytes_transferred, 1310720);
        assert_eq!(report.lost_percent, Some(1.25));
        assert!(report.succeeded());
    }

    #[test]
    fn test_parse_error_report() {
        let report = parse_report(
            Some(1),
            r#"{"start": {}, "end": {},
                "error": "unable to connect to server: Connection refused"}"#,
        )
        .unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.failure_reason(), "unable to connect to server: Connection refused");
    }

    #[test]
    fn test_parse_garbage_is_traffic_error() {
        let err = parse_report(Some(1), "iperf3: error - unable to connect").unwrap_err();
        assert!(matches!(err, ExperimentError::Traffic(_)));
    }

    #[test]
    fn test_zero_bytes_is_not_success() {
        let stdout = r#"{"end": {"sum_sent": {"bytes": 0, "bits_per_second": 0}}}"#;
        let report = parse_report(Some(0), stdout).unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.failure_reason(), "no data transferred");
    }
}
