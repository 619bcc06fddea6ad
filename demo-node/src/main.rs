#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

//! Eseguibile di demo per Veil.
//!
//! Costruisce un [`Collector`] con storage su file, avvia lo scheduler
//! randomizzato e legge comandi da stdin:
//!
//! ```text
//! record <tipo> [count]   registra un evento
//! page <url> [referrer]   navigazione (aggiorna device/attribuzione)
//! flush                   flush manuale
//! status                  stato del collector in JSON
//! epsilon [valore]        mostra o imposta ε
//! quit                    esce
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use veil_core::{
    Collector, CollectorConfig, FileStore, FlushOutcome, KeyValueStore, MemoryStore, PageContext,
    PrivacyState,
};

const DEMO_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) veil-demo/0.1";
const DEMO_START_URL: &str = "https://demo.veil.local/";

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CollectorConfig::from_env().context("invalid VEIL_* configuration")?;
    let collector = build_collector(config)?;
    let scheduler = collector.start_scheduler();

    println!("Veil demo — comandi: record, page, flush, status, epsilon, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            println!("\nEOF rilevato, esco.");
            break;
        };

        match handle_command(&collector, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("Errore: {e:#}"),
        }
    }

    scheduler.abort();
    match collector.flush_now().await {
        FlushOutcome::Flushed(report) => info!(events = report.events, "pending events flushed on exit"),
        FlushOutcome::Failed { events, error } => warn!(events, %error, "events lost on exit"),
        FlushOutcome::NothingToFlush | FlushOutcome::InProgress => {}
    }
    Ok(())
}

/// Storage durevole su file se `data_dir` è configurata, altrimenti in memoria.
fn build_collector(config: CollectorConfig) -> Result<Collector> {
    let durable: Arc<dyn KeyValueStore> = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Unable to create data dir {}", dir.display()))?;
            Arc::new(FileStore::open(dir.join("veil.json"))?)
        }
        None => {
            warn!("VEIL_DATA_DIR not set, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    Collector::builder(config)
        .durable_store(durable)
        .session_store(Arc::new(MemoryStore::new()))
        .page(PageContext::new(DEMO_START_URL, None, DEMO_USER_AGENT))
        .on_settings_change(Arc::new(|state: &PrivacyState| {
            info!(epsilon = state.epsilon, "settings synced");
        }))
        .build()
}

/// Esegue un comando. `Ok(false)` significa uscita.
async fn handle_command(collector: &Collector, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };

    match command {
        "record" => {
            let event_type = parts.next().context("usage: record <type> [count]")?;
            let count = parts
                .next()
                .map(str::parse::<f64>)
                .transpose()
                .context("count must be a number")?
                .unwrap_or(1.0);
            let event = collector.record_with(event_type, count, serde_json::Map::new());
            println!("ok: {} (buffer: {})", event.event_type, collector.buffer_size());
        }
        "page" => {
            let url = parts.next().context("usage: page <url> [referrer]")?;
            let referrer = parts.next().map(str::to_owned);
            let context = PageContext::new(url, referrer, DEMO_USER_AGENT);
            match collector.page_view(context) {
                Some(event) => println!("pageview: {} (buffer: {})", event.page, collector.buffer_size()),
                None => println!("page context updated"),
            }
        }
        "flush" => match collector.flush_now().await {
            FlushOutcome::Flushed(report) => {
                println!("flushed {} events at ε={}", report.events, report.epsilon);
            }
            FlushOutcome::NothingToFlush => println!("buffer vuoto"),
            FlushOutcome::InProgress => println!("flush già in corso"),
            FlushOutcome::Failed { events, error } => {
                println!("flush fallito ({events} eventi rimessi nel buffer): {error}");
            }
        },
        "status" => {
            let status = serde_json::to_string_pretty(&collector.status())?;
            println!("{status}");
        }
        "epsilon" => match parts.next() {
            Some(raw) => {
                let value: f64 = raw.parse().context("epsilon must be a number")?;
                let state = collector.set_epsilon(value)?;
                println!(
                    "ε = {} (budget usato: {:.0}%)",
                    state.epsilon,
                    state.budget_used_percent(veil_core::privacy::DAILY_BUDGET)
                );
            }
            None => println!("ε = {}", collector.epsilon()),
        },
        "quit" | "exit" => {
            println!("Ciao!");
            return Ok(false);
        }
        other => println!("comando sconosciuto: {other}"),
    }

    Ok(true)
}
