//! Cache-aware roofline (CARM) profiling support, x86 only.
//!
//! Roofline analysis piggybacks on the extra-event mechanism: it expands to
//! a vendor-specific bundle of floating-point and memory counter events
//! whose titles carry the reserved `CARM_` prefix. The benchmarking tool
//! itself runs out-of-process; this module only consumes its CSV results.

use std::fs;
use std::path::PathBuf;

use crate::config::Config;
use crate::errors::SessionError;
use crate::event::ExtraEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// Identify the CPU vendor of this machine. Roofline profiling is only
/// supported for Intel and AMD.
pub fn detect_vendor() -> Result<CpuVendor, SessionError> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo")
        .map_err(|err| SessionError::Env(format!("cannot read /proc/cpuinfo: {}", err)))?;
    vendor_from_cpuinfo(&cpuinfo)
}

fn vendor_from_cpuinfo(cpuinfo: &str) -> Result<CpuVendor, SessionError> {
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() == "vendor_id" {
            return match value.trim() {
                "GenuineIntel" => Ok(CpuVendor::Intel),
                "AuthenticAMD" => Ok(CpuVendor::Amd),
                other => Err(SessionError::Env(format!(
                    "roofline profiling is only supported on Intel and AMD CPUs \
                     (detected vendor {:?})",
                    other
                ))),
            };
        }
    }
    Err(SessionError::Env(
        "could not determine the CPU vendor from /proc/cpuinfo".to_string(),
    ))
}

const INTEL_EVENTS: &[(&str, &str)] = &[
    ("fp_arith_inst_retired.scalar_single", "CARM_INTEL_SSP"),
    ("fp_arith_inst_retired.scalar_double", "CARM_INTEL_SDP"),
    ("fp_arith_inst_retired.128b_packed_single", "CARM_INTEL_SSESP"),
    ("fp_arith_inst_retired.128b_packed_double", "CARM_INTEL_SSEDP"),
    ("fp_arith_inst_retired.256b_packed_single", "CARM_INTEL_AVX2SP"),
    ("fp_arith_inst_retired.256b_packed_double", "CARM_INTEL_AVX2DP"),
    ("fp_arith_inst_retired.512b_packed_single", "CARM_INTEL_AVX512SP"),
    ("fp_arith_inst_retired.512b_packed_double", "CARM_INTEL_AVX512DP"),
    ("mem_inst_retired.any", "CARM_INTEL_MEM_LDST"),
];

const AMD_EVENTS: &[(&str, &str)] = &[
    ("retired_sse_avx_operations:sp_mult_add_flops", "CARM_AMD_SPFMA"),
    ("retired_sse_avx_operations:dp_mult_add_flops", "CARM_AMD_DPFMA"),
    ("retired_sse_avx_operations:sp_add_sub_flops", "CARM_AMD_SPADD"),
    ("retired_sse_avx_operations:dp_add_sub_flops", "CARM_AMD_DPADD"),
    ("retired_sse_avx_operations:sp_mult_flops", "CARM_AMD_SPMUL"),
    ("retired_sse_avx_operations:dp_mult_flops", "CARM_AMD_DPMUL"),
    ("retired_sse_avx_operations:sp_div_flops", "CARM_AMD_SPDIV"),
    ("retired_sse_avx_operations:dp_div_flops", "CARM_AMD_DPDIV"),
    ("ls_dispatch:ld_dispatch", "CARM_AMD_LD"),
    ("ls_dispatch:store_dispatch", "CARM_AMD_STORE"),
];

/// The vendor-specific CARM event bundle at the given sampling frequency.
pub fn carm_events(vendor: CpuVendor, freq: u32) -> Vec<ExtraEvent> {
    let table = match vendor {
        CpuVendor::Intel => INTEL_EVENTS,
        CpuVendor::Amd => AMD_EVENTS,
    };
    table
        .iter()
        .map(|(name, title)| ExtraEvent {
            name: name.to_string(),
            period: freq as u64,
            title: title.to_string(),
        })
        .collect()
}

/// Locate the pre-computed roofline benchmark CSV named in the config.
pub fn benchmark_csv(config: &Config) -> Result<PathBuf, SessionError> {
    let path = config.get("roofline_benchmark_path").ok_or_else(|| {
        SessionError::Env(format!(
            "no roofline benchmarking results are configured; run the CARM tool (see \
             carm_tool_path) and put the CSV path in roofline_benchmark_path in {}",
            config.local_path().display()
        ))
    })?;

    let path = PathBuf::from(path);
    let canonical = fs::canonicalize(&path).map_err(|_| {
        SessionError::Env(format!(
            "{} does not exist; verify roofline_benchmark_path in your config file",
            path.display()
        ))
    })?;
    if !canonical.is_file() {
        return Err(SessionError::Env(format!(
            "{} does not point to a regular file; verify roofline_benchmark_path in your \
             config file",
            path.display()
        )));
    }
    Ok(path)
}
