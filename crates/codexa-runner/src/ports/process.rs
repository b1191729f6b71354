//! Listener introspection and signalling.

use std::collections::BTreeSet;

use tokio::process::Command;
use tracing::debug;

use super::{PortError, PortResult};

/// Pids listening on `port`, via `ss` with an `lsof` fallback.
///
/// Errors only when neither tool could be run.
pub async fn find_listening_pids(port: u16) -> PortResult<Vec<u32>> {
    let ss = Command::new("ss")
        .args(["-tlnp", &format!("sport = :{}", port)])
        .output()
        .await;
    let ss_ran = match ss {
        Ok(output) if output.status.success() => {
            let pids = parse_ss_pids(&String::from_utf8_lossy(&output.stdout));
            if !pids.is_empty() {
                return Ok(pids);
            }
            true
        }
        Ok(output) => {
            debug!("ss exited with {}", output.status);
            false
        }
        Err(e) => {
            debug!("ss unavailable: {}", e);
            false
        }
    };

    let lsof = Command::new("lsof")
        .args(["-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .output()
        .await;
    match lsof {
        // lsof exits 1 when nothing matches.
        Ok(output) => Ok(parse_pid_lines(&String::from_utf8_lossy(&output.stdout))),
        Err(_) if ss_ran => Ok(Vec::new()),
        Err(e) => Err(PortError::Introspection(e)),
    }
}

/// Extract every `pid=N` from `ss -p` output.
///
/// Format: `LISTEN 0 511 0.0.0.0:3000 0.0.0.0:* users:(("node",pid=4242,fd=21))`
pub fn parse_ss_pids(output: &str) -> Vec<u32> {
    let mut pids = BTreeSet::new();
    for line in output.lines().skip(1) {
        for part in line.split("pid=").skip(1) {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse::<u32>() {
                pids.insert(pid);
            }
        }
    }
    pids.into_iter().collect()
}

fn parse_pid_lines(output: &str) -> Vec<u32> {
    let pids: BTreeSet<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.into_iter().collect()
}

pub fn signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, signal) == 0 }
}

pub fn is_alive(pid: u32) -> bool {
    signal(pid, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ss_users() {
        let output = "State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n\
LISTEN 0      511          0.0.0.0:3000      0.0.0.0:*    users:((\"node\",pid=4242,fd=21),(\"node\",pid=4243,fd=21))\n\
LISTEN 0      511             [::]:3000         [::]:*    users:((\"node\",pid=4242,fd=22))\n";
        assert_eq!(parse_ss_pids(output), vec![4242, 4243]);
    }

    #[test]
    fn header_only_means_no_listener() {
        assert!(parse_ss_pids("State Recv-Q Send-Q Local Address:Port\n").is_empty());
    }

    #[test]
    fn parses_lsof_lines() {
        assert_eq!(parse_pid_lines("12\n7\n12\n\n"), vec![7, 12]);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }
}
