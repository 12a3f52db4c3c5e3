use crate::ffi::CpuFeatures;

/// Detects the CPU features plugins may specialize for.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn detect_cpu_features() -> CpuFeatures {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::{__cpuid, __get_cpuid_max};
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::{__cpuid, __get_cpuid_max};

    const CPUID_SSE: u32 = 1 << 25;
    const CPUID_3DNOW: u32 = 1 << 31;
    const CPUID_PREFETCH: u32 = 1 << 8;

    let mut features = CpuFeatures::empty();
    unsafe {
        let (max_leaf, _) = __get_cpuid_max(0);
        if max_leaf >= 1 && __cpuid(1).edx & CPUID_SSE != 0 {
            features |= CpuFeatures::SSE;
        }

        // 3DNow! is only usable together with the prefetch instructions
        let (max_extended, _) = __get_cpuid_max(0x8000_0000);
        if max_extended >= 0x8000_0001 {
            let extended = __cpuid(0x8000_0001);
            if extended.edx & CPUID_3DNOW != 0 && extended.ecx & CPUID_PREFETCH != 0 {
                features |= CpuFeatures::AMD_3DNOW;
            }
        }
    }
    features
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn detect_cpu_features() -> CpuFeatures {
    CpuFeatures::empty()
}
