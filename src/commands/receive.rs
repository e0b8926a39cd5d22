use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::config::Config;
use crate::receiver::ReceiverSession;

/// Kick off the receiver side:
///     - Build the configuration (relay/destination/overwrite from the CLI)
///     - Join the transfer the sender announced
///     - Decrypt and persist the files, rendering progress as a bar
pub async fn run(
    name: String,
    destination: Option<String>,
    relay: Option<String>,
    overwrite: bool,
) -> Result<(), Box<dyn Error>> {
    let mut config = Config::default();
    if let Some(relay) = relay {
        config.relay_url = relay;
    }
    if let Some(destination) = destination {
        config.destination_dir = PathBuf::from(destination);
    }
    config.overwrite = overwrite;
    debug!(
        "receiving '{}' via relay {} into {}",
        name,
        config.relay_url,
        config.destination_dir.display()
    );

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            .expect("progress template is valid"),
    );

    let progress_bar = bar.clone();
    let session = ReceiverSession::new(config, name).with_progress(Arc::new(
        move |index, done, total| {
            if progress_bar.length() != Some(total) {
                progress_bar.set_length(total);
                progress_bar.set_message(format!("file {}", index + 1));
            }
            progress_bar.set_position(done);
        },
    ));

    session.run().await?;
    bar.finish_with_message("Receive complete");
    println!("Receive complete!");
    Ok(())
}
