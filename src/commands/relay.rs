use std::error::Error;

use log::debug;

use crate::config::Config;

/// Run the relay until interrupted.
///
/// The relay is stateless: it pairs peers into rooms by transfer name,
/// forwards their opaque frames, and forgets everything the moment a room
/// closes. Defaults come from the configuration record; the CLI may override
/// the bind address and port.
pub async fn run(listen_addr: Option<String>, port: Option<u16>) -> Result<(), Box<dyn Error>> {
    let config = Config::default();
    let addr = listen_addr.unwrap_or(config.listen_addr);
    let port = port.unwrap_or(config.listen_port);
    debug!("starting relay on {addr}:{port}");

    println!("Starting relay on {addr}:{port}");
    crate::relay::run(&addr, port).await?;
    Ok(())
}
