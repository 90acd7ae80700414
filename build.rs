use std::fs;
use std::path::Path;

/// `#define NAME "value"` entries read from wifi_config.h, exported as
/// compile-time env vars.
const DEFINES: [&str; 3] = ["WIFI_SSID", "WIFI_PASSWORD", "AUTH_TOKEN"];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Add crash log helper for better panic diagnostics
    println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");

    let config_path = "wifi_config.h";
    println!("cargo:rerun-if-changed={config_path}");

    let contents = if Path::new(config_path).exists() {
        fs::read_to_string(config_path)?
    } else {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
        String::new()
    };

    for name in DEFINES {
        let value = contents
            .lines()
            .find(|l| l.contains(&format!("#define {name} ")))
            .and_then(|l| l.split('"').nth(1))
            .unwrap_or("");
        println!("cargo:rustc-env={name}={value}");
    }

    Ok(())
}
