//! Read-only host facts: OS, CPU, memory, root filesystem and uptime.
//!
//! Each fact comes from its own command. A command that fails or prints
//! something unexpected leaves that fact unset and adds a line to
//! [`HostFacts::errors`]; the rest are still collected.

use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::executor::{CommandRunner, Session};
use crate::log::*;
use crate::shell::ShellCommand;

#[derive(Getters, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsFacts {
    name: Option<String>,
    version: Option<String>,
    id: Option<String>,
    kernel: Option<String>,
}

#[derive(Getters, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    one: f64,
    five: f64,
    fifteen: f64,
}

#[derive(Getters, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuFacts {
    model: Option<String>,
    cores: Option<u32>,
    load: Option<LoadAverage>,
}

#[derive(Getters, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFacts {
    total_bytes: u64,
    available_bytes: u64,
}

impl MemoryFacts {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    pub fn usage_percent(&self) -> f64 {
        percent(self.used_bytes(), self.total_bytes)
    }
}

/// Usage of the filesystem holding `/`.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskFacts {
    filesystem: String,
    mount_point: String,
    total_bytes: u64,
    used_bytes: u64,
    available_bytes: u64,
}

impl DiskFacts {
    pub fn usage_percent(&self) -> f64 {
        percent(self.used_bytes, self.total_bytes)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10000.0).round() / 100.0
}

#[derive(Getters, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    host: String,
    reachable: bool,
    message: String,
    os: OsFacts,
    cpu: CpuFacts,
    memory: Option<MemoryFacts>,
    disk: Option<DiskFacts>,
    uptime: Option<Duration>,
    errors: Vec<String>,
}

impl HostFacts {
    pub(crate) fn unreachable<S: Into<String>>(host: &str, message: S) -> Self {
        Self {
            host: host.to_string(),
            reachable: false,
            message: message.into(),
            os: OsFacts::default(),
            cpu: CpuFacts::default(),
            memory: None,
            disk: None,
            uptime: None,
            errors: vec![],
        }
    }
}

/// Runs one read-only command per fact and remembers what went wrong.
struct Reader<'a> {
    session: &'a mut dyn Session,
    timeout: Duration,
    errors: Vec<String>,
    lost: bool,
}

impl Reader<'_> {
    async fn read(&mut self, fact: &str, command: ShellCommand) -> Option<String> {
        if self.lost {
            return None;
        }
        match CommandRunner.run(&mut *self.session, &command, self.timeout).await {
            Ok(result) if result.success() => Some(result.stdout().clone()),
            Ok(result) => {
                let reason = if *result.timed_out() {
                    "timed out".to_string()
                } else {
                    match result.diagnostic() {
                        "" => format!("exit code {}", result.exit_code()),
                        text => text.to_string(),
                    }
                };
                self.fail(fact, reason);
                None
            }
            Err(err) => {
                self.fail(fact, err.to_string());
                self.lost = true;
                None
            }
        }
    }

    fn fail<S: Into<String>>(&mut self, fact: &str, reason: S) {
        let line = format!("{fact}: {}", reason.into());
        debug!("fact not collected, {}", line);
        self.errors.push(line);
    }

    fn parsed<T>(&mut self, fact: &str, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.fail(fact, "unexpected output");
        }
        value
    }
}

fn cat(path: &str) -> ShellCommand {
    ShellCommand::new("cat").arg(path)
}

pub(crate) async fn gather(host: &str, session: &mut dyn Session, timeout: Duration) -> HostFacts {
    let mut reader = Reader {
        session,
        timeout,
        errors: vec![],
        lost: false,
    };

    let mut os = match reader.read("os", cat("/etc/os-release")).await {
        Some(text) => parse_os_release(&text),
        None => OsFacts::default(),
    };
    os.kernel = reader
        .read("kernel", ShellCommand::new("uname").arg("-r"))
        .await
        .map(|text| text.trim().to_string())
        .filter(|kernel| !kernel.is_empty());

    let mut cpu = CpuFacts::default();
    if let Some(text) = reader.read("cpu model", cat("/proc/cpuinfo")).await {
        cpu.model = parse_cpu_model(&text);
    }
    if let Some(text) = reader
        .read("cpu cores", ShellCommand::new("nproc").arg("--all"))
        .await
    {
        cpu.cores = reader.parsed("cpu cores", text.trim().parse().ok());
    }
    if let Some(text) = reader.read("load", cat("/proc/loadavg")).await {
        cpu.load = reader.parsed("load", parse_load(&text));
    }

    let memory = match reader.read("memory", cat("/proc/meminfo")).await {
        Some(text) => reader.parsed("memory", parse_meminfo(&text)),
        None => None,
    };
    let disk = match reader
        .read("disk", ShellCommand::new("df").args(["-P", "-k", "/"]))
        .await
    {
        Some(text) => reader.parsed("disk", parse_df(&text)),
        None => None,
    };
    let uptime = match reader.read("uptime", cat("/proc/uptime")).await {
        Some(text) => reader.parsed("uptime", parse_uptime(&text)),
        None => None,
    };

    let message = match reader.errors.len() {
        0 => "all facts collected".to_string(),
        n => format!("{n} fact(s) not collected"),
    };
    HostFacts {
        host: host.to_string(),
        reachable: !reader.lost,
        message,
        os,
        cpu,
        memory,
        disk,
        uptime,
        errors: reader.errors,
    }
}

fn parse_os_release(text: &str) -> OsFacts {
    let mut facts = OsFacts::default();
    let mut version_id = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "PRETTY_NAME" => facts.name = Some(value),
            "VERSION" => facts.version = Some(value),
            "VERSION_ID" => version_id = Some(value),
            "ID" => facts.id = Some(value),
            _ => {}
        }
    }
    if facts.version.is_none() {
        facts.version = version_id;
    }
    facts
}

/// x86 names the CPU `model name`; some ARM kernels only print `Model`.
fn parse_cpu_model(text: &str) -> Option<String> {
    ["model name", "Model"].iter().find_map(|wanted| {
        text.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == *wanted && !value.trim().is_empty()).then(|| value.trim().to_string())
        })
    })
}

fn parse_load(text: &str) -> Option<LoadAverage> {
    let mut fields = text.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some(LoadAverage {
        one: fields.next()??,
        five: fields.next()??,
        fifteen: fields.next()??,
    })
}

/// `/proc/meminfo` counts in kB. Older kernels lack `MemAvailable`.
fn parse_meminfo(text: &str) -> Option<MemoryFacts> {
    let field = |name: &str| {
        text.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kb * 1024)
        })
    };
    Some(MemoryFacts {
        total_bytes: field("MemTotal")?,
        available_bytes: field("MemAvailable").or_else(|| field("MemFree"))?,
    })
}

/// POSIX `df -P -k` output: a header, then one line in 1024-byte blocks.
fn parse_df(text: &str) -> Option<DiskFacts> {
    let line = text.lines().nth(1)?;
    let fields: Vec<_> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let blocks = |i: usize| fields[i].parse::<u64>().ok().map(|kb| kb * 1024);
    Some(DiskFacts {
        filesystem: fields[0].to_string(),
        mount_point: fields[5..].join(" "),
        total_bytes: blocks(1)?,
        used_bytes: blocks(2)?,
        available_bytes: blocks(3)?,
    })
}

fn parse_uptime(text: &str) -> Option<Duration> {
    let seconds: f64 = text.split_whitespace().next()?.parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;
    use crate::testing::FakeHost;

    const OS_RELEASE: &str = "NAME=\"Ubuntu\"\nVERSION=\"22.04.4 LTS (Jammy Jellyfish)\"\nID=ubuntu\n\
                              ID_LIKE=debian\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nVERSION_ID=\"22.04\"\n";
    const MEMINFO: &str = "MemTotal:        8000000 kB\nMemFree:          500000 kB\nMemAvailable:    2000000 kB\n";
    const DF: &str = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
                      /dev/sda1         41152736 12000000  27000000      31% /\n";

    fn healthy() -> FakeHost {
        FakeHost::new()
            .on("os-release", 0, OS_RELEASE, "")
            .on("uname -r", 0, "5.15.0-101-generic\n", "")
            .on("cpuinfo", 0, "processor\t: 0\nmodel name\t: AMD EPYC 7763 64-Core Processor\n", "")
            .on("nproc", 0, "4\n", "")
            .on("loadavg", 0, "0.52 0.41 0.30 1/612 88123\n", "")
            .on("meminfo", 0, MEMINFO, "")
            .on("df -P", 0, DF, "")
            .on("/proc/uptime", 0, "350735.47 1382485.36\n", "")
    }

    #[test]
    fn test_os_release_prefers_pretty_name() {
        let os = parse_os_release(OS_RELEASE);
        assert_eq!(Some("Ubuntu 22.04.4 LTS"), os.name().as_deref());
        assert_eq!(Some("22.04.4 LTS (Jammy Jellyfish)"), os.version().as_deref());
        assert_eq!(Some("ubuntu"), os.id().as_deref());

        let minimal = parse_os_release("ID=\"alpine\"\nVERSION_ID=3.19.1\n");
        assert_eq!(Some("3.19.1"), minimal.version().as_deref());
        assert_eq!(None, *minimal.name());
    }

    #[test]
    fn test_cpu_model_falls_back_to_arm_field() {
        assert_eq!(
            Some("Raspberry Pi 4 Model B Rev 1.4".to_string()),
            parse_cpu_model("processor\t: 0\nBogoMIPS\t: 108.00\n\nModel\t\t: Raspberry Pi 4 Model B Rev 1.4\n")
        );
        assert_eq!(None, parse_cpu_model("processor\t: 0\n"));
    }

    #[test]
    fn test_memory_without_available_uses_free() {
        let memory = parse_meminfo("MemTotal: 1000 kB\nMemFree: 250 kB\n").unwrap();
        assert_eq!(1_024_000, *memory.total_bytes());
        assert_eq!(256_000, *memory.available_bytes());
        assert_eq!(75.0, memory.usage_percent());
        assert_eq!(None, parse_meminfo("MemFree: 250 kB\n"));
    }

    #[test]
    fn test_df_keeps_mount_points_with_spaces() {
        let disk = parse_df("Filesystem 1024-blocks Used Available Capacity Mounted on\nmap 100 25 75 25% /Volumes/My Disk\n")
            .unwrap();
        assert_eq!("/Volumes/My Disk", disk.mount_point());
        assert_eq!(25.0, disk.usage_percent());
        assert_eq!(None, parse_df("Filesystem 1024-blocks Used\n"));
    }

    #[tokio::test]
    async fn test_gather_reads_every_fact() -> Result<()> {
        let host = healthy();
        let mut session = host.session();
        let facts = gather("web01", &mut session, Duration::from_secs(5)).await;

        assert!(*facts.reachable());
        assert!(facts.errors().is_empty(), "{:?}", facts.errors());
        assert_eq!("all facts collected", facts.message());
        assert_eq!(Some("5.15.0-101-generic"), facts.os().kernel().as_deref());
        assert_eq!(Some("AMD EPYC 7763 64-Core Processor"), facts.cpu().model().as_deref());
        assert_eq!(Some(4), *facts.cpu().cores());
        assert_eq!(Some(0.52), facts.cpu().load().map(|l| *l.one()));
        let memory = facts.memory().unwrap();
        assert_eq!(75.0, memory.usage_percent());
        let disk = facts.disk().clone().unwrap();
        assert_eq!("/dev/sda1", disk.filesystem());
        assert_eq!("/", disk.mount_point());
        assert_eq!(Some(Duration::from_secs_f64(350735.47)), *facts.uptime());
        assert_eq!(8, host.commands().len());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_reads_leave_the_rest_intact() -> Result<()> {
        let host = FakeHost::new()
            .on("os-release", 1, "", "cat: /etc/os-release: No such file or directory")
            .on("nproc", 0, "lots\n", "")
            .on("uname -r", 0, "6.1.0\n", "")
            .on("meminfo", 0, MEMINFO, "");
        let mut session = host.session();
        let facts = gather("web01", &mut session, Duration::from_secs(5)).await;

        assert!(*facts.reachable());
        assert_eq!(None, *facts.os().name());
        assert_eq!(Some("6.1.0"), facts.os().kernel().as_deref());
        assert_eq!(None, *facts.cpu().cores());
        assert!(facts.memory().is_some());
        assert!(facts.errors()[0].starts_with("os: cat: /etc/os-release"));
        assert!(facts.errors().contains(&"cpu cores: unexpected output".to_string()));
        // The fake answers unscripted commands with empty output.
        assert!(facts.errors().contains(&"disk: unexpected output".to_string()));
        assert_eq!(8, host.commands().len());
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_connection_stops_collection() -> Result<()> {
        let host = FakeHost::new()
            .on("uname -r", 0, "6.1.0\n", "")
            .drop_on("nproc");
        let mut session = host.session();
        let facts = gather("web01", &mut session, Duration::from_secs(5)).await;

        assert!(!*facts.reachable());
        assert_eq!(Some("6.1.0"), facts.os().kernel().as_deref());
        assert!(facts.memory().is_none());
        assert_eq!(1, facts.errors().len());
        assert!(facts.errors()[0].starts_with("cpu cores: "));
        assert_eq!(4, host.commands().len());
        Ok(())
    }
}
