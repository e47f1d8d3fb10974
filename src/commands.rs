//! One-off commands against an opened (not started) tape offer.

use crate::cli::Command;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use reel_archive::ContainerId;
use reel_offer::TapeOffer;
use std::io::Write;
use std::path::PathBuf;

pub async fn run(offer: &TapeOffer, command: Command) -> Result<()> {
    match command {
        Command::Serve => exn::bail!(ErrorKind::Usage("serve is not a one-off command".to_string())),
        Command::Put { bucket, files } => put(offer, &bucket, &files).await,
        Command::Seal { bucket } => seal(offer, bucket.as_deref()).await,
        Command::Get { id, object, output } => {
            let id = parse_id(&id)?;
            let bytes = match object {
                Some(name) => offer.storage().read_object(&id, &name).await,
                None => offer.storage().get(&id).await,
            }
            .or_raise(|| ErrorKind::Offer)?;
            match output {
                Some(path) => tokio::fs::write(&path, &bytes)
                    .await
                    .or_raise(|| ErrorKind::Io(path.display().to_string())),
                None => std::io::stdout().write_all(&bytes).or_raise(|| ErrorKind::Io("standard output".to_string())),
            }
        },
        Command::Status { id } => {
            let entry = offer.storage().entry(&parse_id(&id)?).await.or_raise(|| ErrorKind::Offer)?;
            match &entry.tape {
                Some(tape) => println!("{} {} {} {}", entry.id, entry.bucket, entry.state, tape),
                None => println!("{} {} {}", entry.id, entry.bucket, entry.state),
            }
            Ok(())
        },
        Command::Submit { bucket, path } => {
            let id = offer.storage().submit_container(&bucket, &path).await.or_raise(|| ErrorKind::Offer)?;
            println!("{id}");
            Ok(())
        },
        Command::Sweep => {
            let report = offer.sweep().run().await.or_raise(|| ErrorKind::Offer)?;
            println!("{} stranded, {} requeued", report.stranded.len(), report.requeued.len());
            Ok(())
        },
        Command::Requeue { bucket } => {
            let requeued = offer.queue().requeue_parked(&bucket).await.or_raise(|| ErrorKind::Offer)?;
            println!("{requeued} requeued");
            Ok(())
        },
        Command::Orders { bucket } => {
            for order in offer.queue().pending(bucket.as_deref()).await.or_raise(|| ErrorKind::Offer)? {
                let state = if order.parked { "parked" } else { "pending" };
                println!(
                    "{} #{} {} {} attempts={} enqueued_at={}",
                    order.bucket,
                    order.sequence,
                    order.container_id,
                    state,
                    order.attempts,
                    order.enqueued_at.unix_timestamp()
                );
            }
            Ok(())
        },
        Command::Tapes { bucket } => {
            for tape in offer.catalog().list(bucket.as_deref()).await.or_raise(|| ErrorKind::Offer)? {
                println!(
                    "{} {} {} files={} bytes={}",
                    tape.label, tape.bucket, tape.state, tape.file_count, tape.written_bytes
                );
            }
            Ok(())
        },
        Command::DriveStatus { index } => {
            let status = offer.drive_status(index).await.or_raise(|| ErrorKind::Offer)?;
            println!("{status:#?}");
            Ok(())
        },
        Command::LibraryStatus => {
            let status = offer.library_status().await.or_raise(|| ErrorKind::Offer)?;
            for drive in &status.drives {
                let tape = drive.cartridge.as_ref().and_then(|cartridge| cartridge.volume_tag.as_deref());
                println!("drive {} {}", drive.index, tape.unwrap_or("-"));
            }
            for slot in &status.slots {
                let tape = slot.cartridge.as_ref().and_then(|cartridge| cartridge.volume_tag.as_deref());
                let kind = if slot.import_export { "mail" } else { "slot" };
                println!("{kind} {} {}", slot.index, tape.unwrap_or("-"));
            }
            Ok(())
        },
    }
}

async fn put(offer: &TapeOffer, bucket: &str, files: &[PathBuf]) -> Result<()> {
    for file in files {
        let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
            exn::bail!(ErrorKind::Usage(format!("{} has no usable file name", file.display())));
        };
        let bytes = tokio::fs::read(file).await.or_raise(|| ErrorKind::Io(file.display().to_string()))?;
        let stored = offer.storage().write(bucket, name, bytes).await.or_raise(|| ErrorKind::Offer)?;
        println!("{} {} {}", stored.name, stored.id, stored.state);
    }
    Ok(())
}

async fn seal(offer: &TapeOffer, bucket: Option<&str>) -> Result<()> {
    let sealed = match bucket {
        Some(bucket) => offer.storage().seal(bucket).await.or_raise(|| ErrorKind::Offer)?.into_iter().collect(),
        None => offer.storage().seal_all().await,
    };
    for id in sealed {
        println!("{id}");
    }
    Ok(())
}

fn parse_id(id: &str) -> Result<ContainerId> {
    id.parse::<ContainerId>().or_raise(|| ErrorKind::Usage(format!("container id {id:?}")))
}
