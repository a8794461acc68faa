use anyhow::{Context, bail};
use slog::{Logger, info, warn};
use std::ffi::CString;
use std::io::{BufRead, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Command;

const KIB_PER_GIB: u64 = 1024 * 1024;
const MIN_RAM_KB: u64 = 32 * KIB_PER_GIB;
/// RAM plus swap some targets need to run without being OOM-killed.
const RECOMMENDED_MEM_KB: u64 = 600 * KIB_PER_GIB;

const HOST_TUNING: &[(&str, &str)] = &[
    ("suid_dumpable", "echo 0 | sudo tee /proc/sys/fs/suid_dumpable"),
    ("core_pattern", "echo core | sudo tee /proc/sys/kernel/core_pattern"),
    (
        "scaling_governor",
        "echo performance | sudo tee /sys/devices/system/cpu/cpu*/cpufreq/scaling_governor",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub swap_kb: u64,
}

fn meminfo_field(text: &str, field: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

pub fn parse_meminfo(text: &str) -> anyhow::Result<MemInfo> {
    let total_kb = meminfo_field(text, "MemTotal").context("MemTotal missing from meminfo")?;
    let swap_kb = meminfo_field(text, "SwapTotal").unwrap_or(0);
    Ok(MemInfo { total_kb, swap_kb })
}

/// Swap to add so RAM plus swap reaches the recommended size, with headroom.
pub fn missing_swap_gib(mem: &MemInfo) -> Option<u64> {
    let have = mem.total_kb + mem.swap_kb;
    (have < RECOMMENDED_MEM_KB).then(|| (RECOMMENDED_MEM_KB - have) / KIB_PER_GIB + 5)
}

/// Size to remount `/tmp` with when it is smaller than the recommended
/// memory total, in decimal GB.
pub fn tmp_remount_size_gb(tmp_kb: u64) -> Option<u64> {
    (tmp_kb < RECOMMENDED_MEM_KB).then_some(RECOMMENDED_MEM_KB / 1000 / 1000)
}

/// Total size of the filesystem holding `path`, in KiB.
fn filesystem_size_kb(path: &Path) -> anyhow::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Invalid path {path:?}"))?;
    // SAFETY: statvfs only writes into the zeroed struct we hand it.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for {path:?}"));
    }
    Ok(stat.f_blocks as u64 * stat.f_frsize as u64 / 1024)
}

fn swap_commands(gib: u64) -> String {
    format!(
        "SWAP=/swap\nsudo fallocate -l {gib}GiB $SWAP\nsudo mkswap $SWAP\nsudo chmod 600 $SWAP\nsudo swapon $SWAP"
    )
}

fn confirm_or_abort(assume_yes: bool) -> anyhow::Result<()> {
    if assume_yes {
        return Ok(());
    }
    print!("Continue anyway? [y/n]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("n") {
        bail!("Aborted by user after environment check");
    }
    Ok(())
}

/// Warns about hosts too small for a full campaign and asks whether to go on.
pub fn check_env(log: &Logger, assume_yes: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
    let mem = parse_meminfo(&text)?;
    info!(log, "Host memory"; "ram_kb" => mem.total_kb, "swap_kb" => mem.swap_kb);

    if mem.total_kb < MIN_RAM_KB {
        warn!(log, "You should have at least 32 GiB of memory.");
        confirm_or_abort(assume_yes)?;
    }
    if let Some(gib) = missing_swap_gib(&mem) {
        warn!(log, "Total memory (RAM+SWAP) is smaller than 600 GiB. This might cause some targets to fail to run.");
        warn!(log, "Consider adding swap space. Run the following outside of the container:\n{}", swap_commands(gib));
        confirm_or_abort(assume_yes)?;
    }

    let tmp_kb = filesystem_size_kb(Path::new("/tmp"))?;
    if let Some(gb) = tmp_remount_size_gb(tmp_kb) {
        warn!(log, "The /tmp directory is too small. This might cause some targets to fail.";
            "tmp_kb" => tmp_kb);
        warn!(log, "Increase its size with: sudo mount -o remount,size={}G /tmp", gb);
        confirm_or_abort(assume_yes)?;
    }
    Ok(())
}

/// Applies the kernel settings AFL++ and friends refuse to run without.
/// Needs sudo.
pub fn tune_host(log: &Logger) -> anyhow::Result<()> {
    for (name, cmd) in HOST_TUNING {
        info!(log, "Setting {}", name; "cmd" => *cmd);
        let status = Command::new("/bin/sh")
            .args(["-c", cmd])
            .stdout(std::process::Stdio::null())
            .status()
            .with_context(|| format!("Failed to run {cmd:?}"))?;
        if !status.success() {
            bail!("Setting {name} failed: {cmd:?} exited with {status}");
        }
    }
    Ok(())
}
