use std::error::Error;
use std::io::{self, Write};

use imei_verifier::{ImeiVerifier, Outcome, VERSION, VerifierConfig};
use tokio::runtime::Runtime;

fn prompt(label: &str) -> io::Result<String> {
    print!("{} ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[test]
#[ignore = "Requires network access, captcha credentials and manual input"]
fn interactive_live_portal() -> Result<(), Box<dyn Error>> {
    println!("imei-verifier {} live portal check", VERSION);
    println!("Credentials are read from CAPTCHA_SERVICE / CAPTCHA_API_KEY_* and PTA_URL.\n");

    let config = VerifierConfig::from_env()?;
    config.validate()?;

    let imei_input = prompt("IMEI [359871977331199]:")?;
    let imei = if imei_input.is_empty() {
        "359871977331199".to_string()
    } else {
        imei_input
    };

    let runtime = Runtime::new()?;
    let verifier = ImeiVerifier::new(config)?;
    println!("{:?}", verifier.health());

    let outcome = runtime.block_on(verifier.verify(&imei));
    match &outcome {
        Outcome::Success { verdict, persisted } => {
            println!("status:    {}", verdict.status);
            println!("message:   {}", verdict.raw_message);
            println!("model:     {}", verdict.device_model.as_deref().unwrap_or("-"));
            println!("persisted: {persisted}");
        }
        Outcome::Failure {
            kind,
            stage,
            attempts,
            message,
        } => {
            println!("failed: {kind} at {stage} after {attempts} attempt(s): {message}");
        }
    }

    if let Some(metrics) = verifier.metrics() {
        println!(
            "requests={} successes={} failures={}",
            metrics.global.total_requests, metrics.global.successes, metrics.global.failures
        );
    }

    Ok(())
}
