// ===============================
// src/recorder.rs
// ===============================
//
// Audit log JSONL: decision, risk rejection, execution request, regime, note.
// - append ke file, BufWriter
// - flush tiap 1s atau tiap FLUSH_EVERY_N_EVENTS event
// - tulis gagal -> reopen sekali, event di-drop kalau tetap gagal
//
// ENV: `RECORD_FILE=/path/to/events.jsonl` (lihat main.rs).
//
use std::io;
use std::path::Path;

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 256;

async fn open_writer(path: &str) -> io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(w: &mut BufWriter<File>, line: &str) -> io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, reopening");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e) => {
                            error!(?e, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e) = write_line(&mut writer, &line).await {
                        error!(?e, "recorder: write failed again, drop event");
                        continue;
                    }
                }
                since_flush += 1;
                if since_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_flush = 0;
                }
            }
            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_flush = 0;
            }
        }
    }
}
