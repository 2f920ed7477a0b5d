//! GPU detection
//!
//! Probes the vendor tools to find an accelerator llama.cpp can offload to.

use std::fmt;
use std::process::Command;

/// Acceleration backend a GPU is driven through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuBackend {
    Cuda,
    Rocm,
    Metal,
    #[default]
    None,
}

impl GpuBackend {
    /// Whether this build of llama.cpp can drive the backend
    pub fn is_compiled_in(&self) -> bool {
        match self {
            GpuBackend::Cuda => cfg!(feature = "cuda"),
            // ROCm devices are reachable through the Vulkan build
            GpuBackend::Rocm => cfg!(feature = "vulkan"),
            GpuBackend::Metal => cfg!(feature = "metal"),
            GpuBackend::None => true,
        }
    }
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GpuBackend::Cuda => "CUDA",
            GpuBackend::Rocm => "ROCm",
            GpuBackend::Metal => "Metal",
            GpuBackend::None => "none",
        };
        f.write_str(name)
    }
}

/// GPU information
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub backend: GpuBackend,
    pub is_available: bool,
}

impl GpuInfo {
    fn not_detected() -> Self {
        Self {
            name: "GPU not detected".to_string(),
            ..Self::default()
        }
    }
}

/// Detect available GPU (best effort)
pub fn detect_gpu() -> GpuInfo {
    if let Some(info) = run_probe("nvidia-smi", &[
        "--query-gpu=name,memory.total",
        "--format=csv,noheader,nounits",
    ])
    .and_then(|out| parse_nvidia_smi(&out))
    {
        return info;
    }

    if let Some(info) = run_probe("rocm-smi", &["--showproductname", "--showmeminfo", "vram", "--csv"])
        .and_then(|out| parse_rocm_smi(&out))
    {
        return info;
    }

    if cfg!(target_os = "macos") {
        if let Some(info) =
            run_probe("system_profiler", &["SPDisplaysDataType"]).and_then(|out| parse_system_profiler(&out))
        {
            return info;
        }
    }

    GpuInfo::not_detected()
}

fn run_probe(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        tracing::debug!("{} exited with {}", program, output.status);
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader,nounits`
pub fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let (name, total) = line.rsplit_once(',')?;
    let vram_total_mb = total.trim().parse::<u64>().ok()?;

    Some(GpuInfo {
        name: name.trim().to_string(),
        vram_total_mb,
        backend: GpuBackend::Cuda,
        is_available: true,
    })
}

/// Parse `rocm-smi --showproductname --showmeminfo vram --csv`
///
/// The CSV header names the columns; VRAM is reported in bytes.
pub fn parse_rocm_smi(stdout: &str) -> Option<GpuInfo> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<&str> = lines.next()?.split(',').map(str::trim).collect();
    let row: Vec<&str> = lines.next()?.split(',').map(str::trim).collect();

    let column = |needle: &str| {
        header
            .iter()
            .position(|h| h.contains(needle))
            .and_then(|idx| row.get(idx).copied())
    };

    let name = column("Card series")
        .or_else(|| column("Card model"))
        .filter(|n| !n.is_empty())?;
    let vram_total_mb = column("VRAM Total Memory")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|bytes| bytes / 1024 / 1024)
        .unwrap_or(0);

    Some(GpuInfo {
        name: name.to_string(),
        vram_total_mb,
        backend: GpuBackend::Rocm,
        is_available: true,
    })
}

/// Parse `system_profiler SPDisplaysDataType`
pub fn parse_system_profiler(stdout: &str) -> Option<GpuInfo> {
    let mut gpu_name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();

        // "Chipset Model: Apple M2 Pro" or "Chipset Model: AMD Radeon Pro 5500M"
        if let Some(name) = trimmed.strip_prefix("Chipset Model:") {
            let name = name.trim();
            if !name.is_empty() && gpu_name.is_none() {
                gpu_name = Some(name.to_string());
            }
        }

        // "VRAM (Total): 16 GB" or "VRAM (Dynamic, Max): 4096 MB"
        if trimmed.starts_with("VRAM") {
            let value = trimmed.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(val) = parts[0].parse::<u64>() {
                    vram_mb = Some(match parts[1].to_uppercase().as_str() {
                        "GB" => val * 1024,
                        _ => val,
                    });
                }
            }
        }
    }

    Some(GpuInfo {
        name: gpu_name?,
        vram_total_mb: vram_mb.unwrap_or(0),
        backend: GpuBackend::Metal,
        is_available: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let info = parse_nvidia_smi("NVIDIA GeForce RTX 4090, 24564\n").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(info.vram_total_mb, 24564);
        assert_eq!(info.backend, GpuBackend::Cuda);
        assert!(info.is_available);

        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
    }

    #[test]
    fn test_parse_rocm_smi() {
        let out = "device,VRAM Total Memory (B),VRAM Total Used Memory (B),Card series,Card model\n\
                   card0,17163091968,10547200,Navi 21 [Radeon RX 6800],0x73bf\n";
        let info = parse_rocm_smi(out).unwrap();
        assert_eq!(info.name, "Navi 21 [Radeon RX 6800]");
        assert_eq!(info.vram_total_mb, 16368);
        assert_eq!(info.backend, GpuBackend::Rocm);

        assert!(parse_rocm_smi("device\n").is_none());
    }

    #[test]
    fn test_parse_system_profiler() {
        let out = "Graphics/Displays:\n\n    Apple M2 Pro:\n\n      Chipset Model: Apple M2 Pro\n      Type: GPU\n      Total Number of Cores: 19\n";
        let info = parse_system_profiler(out).unwrap();
        assert_eq!(info.name, "Apple M2 Pro");
        assert_eq!(info.vram_total_mb, 0);
        assert_eq!(info.backend, GpuBackend::Metal);

        let discrete = "      Chipset Model: AMD Radeon Pro 5500M\n      VRAM (Total): 8 GB\n";
        assert_eq!(parse_system_profiler(discrete).unwrap().vram_total_mb, 8192);

        assert!(parse_system_profiler("Graphics/Displays:\n").is_none());
    }

    #[test]
    fn test_detect_gpu_never_fails() {
        let info = detect_gpu();
        if !info.is_available {
            assert_eq!(info.backend, GpuBackend::None);
        }
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(GpuBackend::Cuda.to_string(), "CUDA");
        assert_eq!(GpuBackend::None.to_string(), "none");
        assert!(GpuBackend::None.is_compiled_in());
    }
}
