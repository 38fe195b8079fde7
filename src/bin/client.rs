use bytes::Bytes;
use std::env;
use std::io::Write;
use std::time::Duration;

use minidfs::config::load_config;
use minidfs::protocol::Command;
use minidfs::util;

fn usage() {
    eprintln!("Usage: client <command> [arguments]");
    eprintln!("Commands:");
    eprintln!("  create <file> <content>");
    eprintln!("  write <file> <content>");
    eprintln!("  append <file> <content>");
    eprintln!("  read <file>");
    eprintln!("  delete <file>");
    eprintln!("  metadata <file>");
    eprintln!("  list");
    eprintln!("  system_info");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config("config.toml")?;
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        usage();
        return Ok(());
    }

    let request = match args[1].as_str() {
        op @ ("create" | "write" | "append") => {
            if args.len() < 4 {
                eprintln!("Usage: client {op} <file> <content>");
                return Ok(());
            }
            let file = args[2].clone();
            let body = Bytes::from(args[3..].join(" ").into_bytes());
            match op {
                "create" => Command::Create { file, body },
                "write" => Command::Write { file, body },
                _ => Command::Append { file, body },
            }
        }
        op @ ("read" | "delete" | "metadata") => {
            if args.len() < 3 {
                eprintln!("Usage: client {op} <file>");
                return Ok(());
            }
            let file = args[2].clone();
            match op {
                "read" => Command::Read { file },
                "delete" => Command::Delete { file },
                _ => Command::Metadata { file },
            }
        }
        "list" => Command::List,
        "system_info" => Command::SystemInfo,
        other => {
            eprintln!("Unknown command: {other}");
            usage();
            return Ok(());
        }
    };

    let reply = util::exchange(
        &config.master_addr(),
        &request.encode(),
        Duration::from_secs(30),
    )
    .await?;

    let mut stdout = std::io::stdout();
    stdout.write_all(&reply)?;
    if !reply.ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}
