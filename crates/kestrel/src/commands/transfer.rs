use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use kestrel_net::Stack;
use kestrel_net::arp::ArpCache;
use kestrel_net::igmp::IgmpMembership;
use kestrel_tftp::{ClientConfig, MtftpSession, Sink, TftpSession};

use crate::nic::DatalinkNic;

fn open_session(config: &ClientConfig) -> Result<TftpSession> {
    let nic = DatalinkNic::open(&config.interface)
        .with_context(|| format!("failed to open interface {}", config.interface))?;
    let stack = Stack::new(
        Box::new(nic),
        Box::new(ArpCache::new()),
        Box::new(IgmpMembership::new()),
        config.stack_config(),
    );
    let mut session = TftpSession::new(stack, config.server_ip, config.transfer_options());
    session.set_server_port(config.server_port);
    session.stack_mut().set_filter(config.ip_filter())?;
    Ok(session)
}

pub fn init_config(path: &Path) -> Result<()> {
    kestrel_tftp::write_default_config(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Configuration file created at: {}", path.display());
    println!("\nPlease review and edit the configuration before transferring.");
    Ok(())
}

pub fn get(
    config: &ClientConfig,
    file: &str,
    output: Option<PathBuf>,
    multicast: bool,
) -> Result<()> {
    let mut session = open_session(config)?;
    let mut data = Vec::new();

    let bytes = if multicast || config.multicast.enabled {
        kestrel_tftp::config::validate_mtftp_config(&config.multicast)?;
        info!(file, group = %config.multicast.group, "starting multicast download");
        let mut session = MtftpSession::new(session, config.mtftp_info());
        session.download(file, &mut Sink::Buffer(&mut data))?
    } else {
        info!(file, server = %config.server_ip, "starting download");
        session.download(file, &mut Sink::Buffer(&mut data))?
    };

    let dest = output.unwrap_or_else(|| local_name(file));
    std::fs::write(&dest, &data)
        .with_context(|| format!("failed to write {}", dest.display()))?;
    println!("Downloaded {} bytes to {}", bytes, dest.display());
    Ok(())
}

pub fn put(config: &ClientConfig, file: &Path, remote_name: Option<String>) -> Result<()> {
    let name = match remote_name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a remote name from {}", file.display()))?,
    };
    let data =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;

    let mut session = open_session(config)?;
    info!(file = name, len = data.len(), server = %config.server_ip, "starting upload");
    let bytes = session.upload(&name, &data)?;
    println!("Uploaded {} bytes as {}", bytes, name);
    Ok(())
}

pub fn size(config: &ClientConfig, file: &str) -> Result<()> {
    let mut session = open_session(config)?;
    let size = session.query_size(file)?;
    println!("{}: {} bytes", file, size);
    Ok(())
}

pub fn dir(config: &ClientConfig, path: &str) -> Result<()> {
    let mut session = open_session(config)?;
    let mut data = Vec::new();
    session.read_directory(path, &mut Sink::Buffer(&mut data))?;
    print!("{}", String::from_utf8_lossy(&data));
    Ok(())
}

/// Local file name for a download when none was given: the last path
/// component of the remote name.
fn local_name(file: &str) -> PathBuf {
    Path::new(file)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(file))
}
