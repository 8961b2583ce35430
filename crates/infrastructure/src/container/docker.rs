use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use zimfarm_core::{SchedulerError, SchedulerResult};

use super::{
    ContainerInfo, ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, ContainerUsage,
};

/// 通过 `docker` 命令行操作容器
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> SchedulerResult<Output> {
        debug!(args = ?args, "docker");
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SchedulerError::ContainerRuntime(format!("无法执行 {}: {e}", self.binary)))
    }

    fn checked(output: Output, action: &str) -> SchedulerResult<String> {
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SchedulerError::ContainerRuntime(format!(
                "{action}失败: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn is_missing(output: &Output) -> bool {
        !output.status.success()
            && String::from_utf8_lossy(&output.stderr).contains("No such")
    }

    fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            args.push("--volume".to_string());
            let mut volume = format!("{}:{}", mount.source, mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push(volume);
        }
        for dns in &spec.dns {
            args.push(format!("--dns={dns}"));
        }
        if let Some(ref dir) = spec.working_dir {
            args.push(format!("--workdir={dir}"));
        }
        if let Some(shares) = spec.cpu_shares {
            args.push(format!("--cpu-shares={shares}"));
        }
        if let Some(memory) = spec.memory_limit {
            args.push(format!("--memory={memory}"));
        }
        if let Some(ref network) = spec.network_mode {
            args.push(format!("--network={network}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(default)]
    networks: BTreeMap<String, InspectEndpoint>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

impl From<InspectOutput> for ContainerInfo {
    fn from(raw: InspectOutput) -> Self {
        let state = match raw.state.status.as_str() {
            "created" => ContainerState::Created,
            "running" | "restarting" | "paused" => ContainerState::Running,
            _ => ContainerState::Exited(raw.state.exit_code),
        };
        let ip_address = Some(raw.network_settings.ip_address)
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                raw.network_settings
                    .networks
                    .into_values()
                    .map(|n| n.ip_address)
                    .find(|ip| !ip.is_empty())
            });
        ContainerInfo {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            image: raw.config.image,
            labels: raw.config.labels.unwrap_or_default(),
            state,
            ip_address,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

fn parse_inspect(raw: &str) -> SchedulerResult<Vec<ContainerInfo>> {
    let parsed: Vec<InspectOutput> = serde_json::from_str(raw)?;
    Ok(parsed.into_iter().map(ContainerInfo::from).collect())
}

fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// 解析 `10.5MiB`、`1.2GB`、`512kB` 形式的大小
fn parse_size(raw: &str) -> u64 {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().unwrap_or(0.0);
    let multiplier = match unit.trim() {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

fn parse_stats(raw: &str) -> SchedulerResult<Option<ContainerUsage>> {
    let Some(line) = raw.lines().find(|l| !l.trim().is_empty()) else {
        return Ok(None);
    };
    let stats: StatsLine = serde_json::from_str(line)?;
    let used = stats.mem_usage.split('/').next().unwrap_or_default();
    Ok(Some(ContainerUsage {
        cpu_percent: parse_percent(&stats.cpu_perc),
        memory_bytes: parse_size(used),
    }))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, image: &str) -> SchedulerResult<()> {
        let output = self
            .exec(&["pull".to_string(), "--quiet".to_string(), image.to_string()])
            .await?;
        Self::checked(output, "拉取镜像")?;
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> SchedulerResult<String> {
        let output = self.exec(&Self::run_args(spec)).await?;
        Self::checked(output, "启动容器")
    }

    async fn inspect(&self, name: &str) -> SchedulerResult<Option<ContainerInfo>> {
        let output = self
            .exec(&["inspect".to_string(), "--type=container".to_string(), name.to_string()])
            .await?;
        if Self::is_missing(&output) {
            return Ok(None);
        }
        let stdout = Self::checked(output, "查询容器")?;
        Ok(parse_inspect(&stdout)?.into_iter().next())
    }

    async fn list(&self, labels: &[(&str, &str)]) -> SchedulerResult<Vec<ContainerInfo>> {
        let mut args = vec!["ps".to_string(), "--all".to_string(), "--quiet".to_string()];
        for (key, value) in labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }
        let ids = Self::checked(self.exec(&args).await?, "列出容器")?;
        let ids: Vec<String> = ids.split_whitespace().map(String::from).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string(), "--type=container".to_string()];
        args.extend(ids);
        let output = self.exec(&args).await?;
        // 两次调用之间容器可能已被删除，inspect会部分失败但仍输出存在的容器
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_inspect(&stdout)
    }

    async fn stop(&self, name: &str, grace: Duration) -> SchedulerResult<()> {
        let output = self
            .exec(&[
                "stop".to_string(),
                format!("--time={}", grace.as_secs()),
                name.to_string(),
            ])
            .await?;
        if Self::is_missing(&output) {
            return Ok(());
        }
        Self::checked(output, "停止容器")?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> SchedulerResult<()> {
        let output = self
            .exec(&["rm".to_string(), "--force".to_string(), name.to_string()])
            .await?;
        if Self::is_missing(&output) {
            return Ok(());
        }
        Self::checked(output, "删除容器")?;
        Ok(())
    }

    async fn logs(&self, name: &str, tail: Option<usize>) -> SchedulerResult<ContainerLogs> {
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = tail {
            args.push(format!("--tail={tail}"));
        }
        args.push(name.to_string());
        let output = self.exec(&args).await?;
        if !output.status.success() {
            return Err(SchedulerError::ContainerRuntime(format!(
                "读取日志失败: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn usage(&self, name: &str) -> SchedulerResult<Option<ContainerUsage>> {
        let output = self
            .exec(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format={{json .}}".to_string(),
                name.to_string(),
            ])
            .await?;
        if Self::is_missing(&output) {
            return Ok(None);
        }
        let stdout = Self::checked(output, "读取资源使用")?;
        parse_stats(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Mount;

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec::new("abc123_scraper", "mwoffliner:1")
            .with_label("zimfarm.role", "scraper")
            .with_env("TZ", "UTC")
            .with_mount(Mount::bind("/data/abc", "/output"))
            .with_mount(Mount::bind("/var/run/docker.sock", "/var/run/docker.sock").read_only())
            .with_command(vec!["mwoffliner".into(), "--verbose".into()]);
        let mut spec = spec;
        spec.dns = vec!["172.17.0.2".into()];
        spec.memory_limit = Some(1024);

        let args = DockerCli::run_args(&spec);
        assert_eq!(&args[..4], &["run", "--detach", "--name", "abc123_scraper"]);
        assert!(args.windows(2).any(|w| w == ["--label", "zimfarm.role=scraper"]));
        assert!(args.windows(2).any(|w| w == ["--env", "TZ=UTC"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--volume", "/var/run/docker.sock:/var/run/docker.sock:ro"]));
        assert!(args.contains(&"--dns=172.17.0.2".to_string()));
        assert!(args.contains(&"--memory=1024".to_string()));
        let image_pos = args.iter().position(|a| a == "mwoffliner:1").expect("image");
        assert_eq!(&args[image_pos + 1..], &["mwoffliner", "--verbose"]);
    }

    #[test]
    fn test_parse_inspect() {
        let raw = r#"[{
            "Id": "deadbeef",
            "Name": "/abc123_scraper",
            "State": {"Status": "exited", "ExitCode": 2},
            "Config": {"Image": "mwoffliner:1", "Labels": {"zimfarm.role": "scraper"}},
            "NetworkSettings": {"IPAddress": "", "Networks": {"bridge": {"IPAddress": "172.17.0.5"}}}
        }]"#;
        let info = parse_inspect(raw).expect("parse").remove(0);
        assert_eq!(info.name, "abc123_scraper");
        assert_eq!(info.state, ContainerState::Exited(2));
        assert_eq!(info.label("zimfarm.role"), Some("scraper"));
        assert_eq!(info.ip_address.as_deref(), Some("172.17.0.5"));
    }

    #[test]
    fn test_parse_stats() {
        let usage = parse_stats(r#"{"CPUPerc":"12.50%","MemUsage":"1.5MiB / 1.944GiB"}"#)
            .expect("parse")
            .expect("present");
        assert_eq!(usage.cpu_percent, 12.5);
        assert_eq!(usage.memory_bytes, 1572864);
        assert!(parse_stats("").expect("parse").is_none());
        assert_eq!(parse_size("512kB"), 512_000);
        assert_eq!(parse_size("0B"), 0);
    }
}
