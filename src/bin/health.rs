use std::env;
use std::process::ExitCode;
use std::time::Duration;

use reqwest::Url;

fn main() -> ExitCode {
    let Some(arg) = env::args().nth(1) else {
        eprintln!("Missing URL argument");
        return ExitCode::FAILURE;
    };

    match check(&arg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Health check failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn check(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(url)?;

    // The service usually runs with a self-signed certificate inside the container.
    let client = reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(10))
        .build()?;
    let response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(format!("Request failed with status {}", response.status()).into());
    }

    Ok(())
}
