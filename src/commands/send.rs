use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::config::Config;
use crate::sender::SenderSession;

/// Kick off the sender side:
///     - Build the configuration (relay override from the CLI)
///     - Register a transfer name and print it for the receiving side
///     - Stream the files, rendering progress as a bar
pub async fn run(
    paths: Vec<String>,
    name: Option<String>,
    relay: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let mut config = Config::default();
    if let Some(relay) = relay {
        config.relay_url = relay;
    }
    debug!("sending via relay {}", config.relay_url);

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            .expect("progress template is valid"),
    );

    let progress_bar = bar.clone();
    let mut session = SenderSession::new(config, paths.into_iter().map(PathBuf::from).collect())
        .with_progress(Arc::new(move |index, done, total| {
            if progress_bar.length() != Some(total) {
                progress_bar.set_length(total);
                progress_bar.set_message(format!("file {}", index + 1));
            }
            progress_bar.set_position(done);
        }))
        .on_name_allocated(Arc::new(|name| {
            println!("Transfer name: \x1b[4m\x1b[1m{name}\x1b[0m");
            println!("Receive with: caesar-transfer receive {name}");
        }));
    if let Some(name) = name {
        session = session.with_transfer_name(name);
    }

    session.run().await?;
    bar.finish_with_message("Transfer complete");
    println!("Transfer complete!");
    Ok(())
}
