use std::{path::PathBuf, process::ExitCode, time::Duration};
use clap::Parser;
use riptide::{Client, MetaInfo, Status, TorrentStat};

#[derive(Parser)]
#[command(name = "riptide", about = "A small BitTorrent client", version)]
struct Args {

    /// Path to the .torrent file
    torrent: PathBuf,

    /// Print metainfo and exit
    #[arg(short, long)]
    info: bool,

    /// Print counts of seeders/leechers and exit
    #[arg(short, long)]
    scrape: bool,

    /// Verbose level (0 to 9)
    #[arg(short, long, default_value_t = 0)]
    verbose: i32,

    /// Port we should listen on
    #[arg(short, long, default_value_t = 9090)]
    port: u16,

    /// Maximum upload rate in KB/s (-1 = no limit)
    #[arg(short, long, default_value_t = 20)]
    upload: i64,

}

#[tokio::main]
async fn main() -> ExitCode {

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let verbose = args.verbose.clamp(0, 9);
    if verbose > 0 {
        std::env::set_var("TR_DEBUG", verbose.to_string());
    }
    init_logging(verbose);

    if args.port == 0 {
        eprintln!("Invalid port '0'");
        return ExitCode::from(1);
    }

    let mut client = Client::new();
    client.set_bind_port(args.port);
    client.set_upload_limit(args.upload);

    let t = match client.torrent_init(&args.torrent) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed opening torrent file {}: {}", args.torrent.display(), e);
            return ExitCode::from(1);
        }
    };

    if args.info {
        print_info(client.metainfo(t));
        client.torrent_close(t);
        client.close();
        return ExitCode::SUCCESS;
    }

    if args.scrape {
        match client.torrent_scrape(t).await {
            Ok((seeders, leechers)) => {
                println!("{} seeder(s), {} leecher(s).", seeders, leechers)
            }
            Err(e) => {
                tracing::debug!("scrape error: {}", e);
                println!("Scrape failed.");
            }
        }
        client.torrent_close(t);
        client.close();
        return ExitCode::SUCCESS;
    }

    client.torrent_set_folder(t, ".".into());
    client.torrent_start(t);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        render_status(&client.torrent_stat(t));
    }
    eprintln!();

    client.torrent_stop(t).await;
    client.torrent_close(t);
    client.close();
    ExitCode::SUCCESS
}

fn init_logging(verbose: i32) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(sub).ok();
}

fn print_info(metainfo: &MetaInfo) {
    println!("hash:     {}", metainfo.info_hash_hex());
    println!("tracker:  {}:{}", metainfo.tracker_host(), metainfo.tracker_port());
    println!("announce: {}", metainfo.announce.path());
    let total = metainfo.total_len();
    let piece = metainfo.piece_len() as u64;
    println!("size:     {} ({} * {} + {})", total, total / piece, piece, total % piece);
    if let Some(date) = metainfo.creation_date_fmt() {
        println!("created:  {}", date);
    }
    if let Some(comment) = &metainfo.comment {
        println!("comment:  {}", comment);
    }
    println!("file(s):");
    for file in metainfo.files() {
        println!(" {} ({})", file.path.display(), file.length);
    }
}

// One status line, redrawn in place every second.
fn render_status(stat: &TorrentStat) {
    let line = match stat.status {
        Status::Pause => "Paused".to_string(),
        Status::Check => format!("Checking files... {:.2} %", 100.0 * stat.progress),
        Status::Download | Status::TrackerError => format!(
            "Progress: {:.2} %, downloading from {} of {} peer{}, D: {:.2} / U: {:.2} KB/s",
            100.0 * stat.progress,
            stat.peers_uploading,
            stat.peers_total,
            if stat.peers_total == 1 { "" } else { "s" },
            stat.rate_download,
            stat.rate_upload,
        ),
        Status::Seed => format!(
            "Seeding, uploading to {} of {} peer(s), {:.2} KB/s",
            stat.peers_downloading, stat.peers_total, stat.rate_upload,
        ),
    };
    eprint!("\r{:<79}", line);
    if stat.status == Status::TrackerError {
        if let Some(error) = &stat.error {
            eprintln!();
            eprintln!("{}", error);
        }
    }
}
