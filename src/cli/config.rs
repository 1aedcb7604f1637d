use crate::config::generate::generate_starter_config;
use crate::config::load_config;
use crate::formatter::FormatterRegistry;
use std::fs;
use std::path::{Path, PathBuf};

/// Write the starter config to `~/.config/logship/config.yml` (falling back
/// to `/etc/logship/config.yml`), or print it
pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = generate_starter_config();

    if stdout {
        print!("{}", content);
        return Ok(());
    }

    let config_path = dirs::home_dir()
        .map(|home| home.join(".config/logship/config.yml"))
        .filter(|path| match path.parent() {
            Some(parent) => match fs::create_dir_all(parent) {
                Ok(()) => true,
                Err(_) => {
                    eprintln!("Warning: Could not create directory {}", parent.display());
                    eprintln!("Falling back to /etc/logship/config.yml");
                    false
                }
            },
            None => false,
        })
        .unwrap_or_else(|| PathBuf::from("/etc/logship/config.yml"));

    write_new(&config_path, &content)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

fn write_new(path: &Path, content: &str) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            path.display()
        )
        .into());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    let formatters = FormatterRegistry::with_builtins();
    match load_config(&path, &formatters) {
        Ok(config) => {
            println!("✓ Config is valid ({} sources)", config.sources.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            Err(e.into())
        }
    }
}
