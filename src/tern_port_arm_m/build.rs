fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();

    println!("cargo:rustc-check-cfg=cfg(armv6m)");
    println!("cargo:rustc-check-cfg=cfg(armv8m_base)");
    println!("cargo:rustc-check-cfg=cfg(has_basepri)");
    println!("cargo:rustc-check-cfg=cfg(has_fpu)");

    // The Armv6-M and Armv8-M Baseline instruction sets lack BASEPRI and
    // the wide forms of STM/LDM used by the context switcher.
    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    } else if target.starts_with("thumbv8m.base") {
        println!("cargo:rustc-cfg=armv8m_base");
    } else if target.starts_with("thumbv7") || target.starts_with("thumbv8m.main") {
        println!("cargo:rustc-cfg=has_basepri");
    }

    if target.ends_with("eabihf") {
        println!("cargo:rustc-cfg=has_fpu");
    }
}
