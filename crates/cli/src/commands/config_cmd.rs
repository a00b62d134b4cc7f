//! `runloop config`: configuration management commands.

use runloop_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed successfully");

            let mut warnings = Vec::new();

            if config.engine.run_timeout_secs.is_none() {
                warnings.push("No run timeout set; runs only end on their step budget");
            }

            if !config.truncation.enabled {
                warnings.push("Truncation disabled; long conversations go to the model as-is");
            }

            if config.llm_retry.max_attempts == 1 {
                warnings.push("Retries disabled; any transient model error fails the run");
            }

            if warnings.is_empty() {
                println!("   All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Model:        {}", config.default_model);
            println!("   Max steps:    {}", config.engine.max_steps);
            println!(
                "   Concurrency:  {} tool(s), {} model call(s)",
                config.engine.tool_concurrency, config.engine.llm_concurrency
            );
            println!(
                "   Input limit:  {} tokens",
                config.truncation.max_input_tokens_for(&config.default_model)
            );
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
