use rustc_version::version;
use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;

fn sanitize_env_value(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.contains('\n') || s.contains('\r') || s.contains('\0') {
        return None;
    }
    Some(s.to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=TARGET");
    println!("cargo:rerun-if-env-changed=PROFILE");

    let now = OffsetDateTime::now_utc();
    let build_date = now
        .format(&Iso8601::DEFAULT)
        .unwrap_or_else(|_| format!("unix:{}", now.unix_timestamp()));
    if let Some(v) = sanitize_env_value(&build_date) {
        println!("cargo:rustc-env=CLAWRDEN_BUILD_DATE={v}");
    }

    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    if let Some(v) = sanitize_env_value(&target) {
        println!("cargo:rustc-env=CLAWRDEN_BUILD_TARGET={v}");
    }

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    if let Some(v) = sanitize_env_value(&profile) {
        println!("cargo:rustc-env=CLAWRDEN_BUILD_PROFILE={v}");
    }

    let rustc_ver = version()
        .map(|v| v.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Some(v) = sanitize_env_value(&rustc_ver) {
        println!("cargo:rustc-env=CLAWRDEN_BUILD_RUSTC={v}");
    }
}
