use tracing::info;

pub fn system_info() -> anyhow::Result<()> {
    info!("System Information:");
    cpu_info()?;
    info!(
        "Inference | {}",
        if crate::direct_ml_available() {
            "DirectML"
        } else {
            "CPU"
        }
    );
    Ok(())
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn cpu_model() -> String {
    use raw_cpuid::CpuId;
    let cpuid = CpuId::new();
    match cpuid.get_processor_brand_string() {
        Some(cpu_brand) => cpu_brand.as_str().to_owned(),
        None => "Unknown".to_owned(),
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn cpu_model() -> String {
    std::env::consts::ARCH.to_owned()
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn cpu_vendor() -> String {
    use raw_cpuid::CpuId;
    match CpuId::new().get_vendor_info() {
        Some(vendor_info) => vendor_info.as_str().to_owned(),
        None => "Unknown".to_owned(),
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn cpu_vendor() -> String {
    "Unknown".to_owned()
}

pub fn cpu_info() -> anyhow::Result<()> {
    info!(
        "CPU | {} | {} | {} Cores | {} Logical Cores",
        cpu_vendor(),
        cpu_model(),
        num_cpus::get_physical(),
        num_cpus::get()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_model_is_never_empty() {
        assert!(!cpu_model().is_empty());
        assert!(cpu_info().is_ok());
    }
}
