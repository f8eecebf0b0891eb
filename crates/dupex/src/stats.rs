//! Progress and statistics reporting.
//!
//! A single-writer actor on a bounded FIFO queue; the pipeline posts
//! fire-and-forget updates and never reads anything back. Rendering is
//! either an in-place console meter or plain log lines.

use std::io::Write;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};

const QUEUE_CAPACITY: usize = 10;

#[derive(Debug)]
enum Message {
    Start,
    SetFileCount(usize),
    StartFileinfoProgress,
    FileInfoRead,
    FileAdded,
    StartHashProgress,
    HashesCalculated(usize),
    StartDedupProgress,
    Deduplicating(usize),
    StopProgress,
    Stop,
}

/// Cloneable sending side of the statistics actor.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: Sender<Message>,
}

impl StatsHandle {
    fn send(&self, message: Message) {
        // A vanished actor only costs us reporting.
        let _ = self.tx.send(message);
    }

    pub fn start(&self) {
        self.send(Message::Start);
    }

    pub fn set_file_count(&self, count: usize) {
        self.send(Message::SetFileCount(count));
    }

    pub fn start_fileinfo_progress(&self) {
        self.send(Message::StartFileinfoProgress);
    }

    /// One fragment-map attempt finished, successful or not.
    pub fn file_info_read(&self) {
        self.send(Message::FileInfoRead);
    }

    /// A candidate file passed the size filter during the walk.
    pub fn file_added(&self) {
        self.send(Message::FileAdded);
    }

    pub fn start_hash_progress(&self) {
        self.send(Message::StartHashProgress);
    }

    pub fn hashes_calculated(&self, count: usize) {
        self.send(Message::HashesCalculated(count));
    }

    pub fn start_dedup_progress(&self) {
        self.send(Message::StartDedupProgress);
    }

    pub fn deduplicating(&self, count: usize) {
        self.send(Message::Deduplicating(count));
    }

    pub fn stop_progress(&self) {
        self.send(Message::StopProgress);
    }
}

/// The running actor; owns the worker thread.
pub struct Stats {
    handle: StatsHandle,
    worker: JoinHandle<()>,
}

impl Stats {
    /// Spawns the actor. `console` selects the in-place meter over plain
    /// log lines.
    pub fn spawn(console: bool) -> Stats {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let worker = std::thread::Builder::new()
            .name("stats".into())
            .spawn(move || Actor::new(console).run(rx))
            .expect("failed to spawn statistics thread");
        Stats {
            handle: StatsHandle { tx },
            worker,
        }
    }

    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }

    /// Stops the actor after it has drained all pending updates.
    pub fn stop(self) {
        self.handle.send(Message::Stop);
        drop(self.handle);
        let _ = self.worker.join();
    }
}

trait Meter {
    fn add(&mut self, count: usize);
    fn finish(&mut self);
}

/// Logs a line whenever the percentage ticks up; for non-interactive runs.
struct LogMeter {
    total: usize,
    count: usize,
    last_logged: usize,
}

impl LogMeter {
    fn new(total: usize) -> Self {
        Self {
            total,
            count: 0,
            last_logged: 0,
        }
    }
}

impl Meter for LogMeter {
    fn add(&mut self, count: usize) {
        self.count += count;
        if self.total == 0 {
            return;
        }
        let percentage = self.count * 100 / self.total;
        if percentage > self.last_logged {
            log::info!("progress: {percentage}% ({}/{})", self.count, self.total);
            self.last_logged = percentage;
        }
    }

    fn finish(&mut self) {}
}

/// Redraws a single stderr line, at most once a second.
struct ConsoleMeter {
    total: usize,
    count: usize,
    last_drawn: Instant,
}

impl ConsoleMeter {
    fn new(total: usize) -> Self {
        Self {
            total,
            count: 0,
            last_drawn: Instant::now() - Duration::from_secs(1),
        }
    }

    fn draw(&mut self) {
        let percentage = if self.total == 0 {
            100
        } else {
            self.count * 100 / self.total
        };
        eprint!("\r{}/{} ({percentage}%)  ", self.count, self.total);
        let _ = std::io::stderr().flush();
        self.last_drawn = Instant::now();
    }
}

impl Meter for ConsoleMeter {
    fn add(&mut self, count: usize) {
        self.count += count;
        if self.last_drawn.elapsed() >= Duration::from_secs(1) {
            self.draw();
        }
    }

    fn finish(&mut self) {
        self.draw();
        eprintln!();
    }
}

struct Pass {
    name: &'static str,
    started: Instant,
    meter: Box<dyn Meter>,
}

struct Actor {
    console: bool,
    started: Option<Instant>,
    file_count: usize,
    files_found: usize,
    hash_total: usize,
    pass: Option<Pass>,
}

impl Actor {
    fn new(console: bool) -> Self {
        Self {
            console,
            started: None,
            file_count: 0,
            files_found: 0,
            hash_total: 0,
            pass: None,
        }
    }

    fn start_pass(&mut self, name: &'static str, total: usize) {
        log::info!("{name}");
        let meter: Box<dyn Meter> = if self.console {
            Box::new(ConsoleMeter::new(total))
        } else {
            Box::new(LogMeter::new(total))
        };
        self.pass = Some(Pass {
            name,
            started: Instant::now(),
            meter,
        });
    }

    fn add(&mut self, count: usize) {
        if let Some(pass) = &mut self.pass {
            pass.meter.add(count);
        }
    }

    fn run(mut self, rx: Receiver<Message>) {
        while let Ok(message) = rx.recv() {
            match message {
                Message::Start => self.started = Some(Instant::now()),
                Message::SetFileCount(count) => self.file_count = count,
                Message::StartFileinfoProgress => {
                    self.start_pass("collecting file information", self.file_count)
                }
                Message::FileInfoRead => self.add(1),
                Message::FileAdded => self.files_found += 1,
                Message::StartHashProgress => {
                    self.start_pass("hashing the first block of each file", self.files_found)
                }
                Message::HashesCalculated(count) => {
                    self.hash_total += count;
                    self.add(count);
                }
                Message::StartDedupProgress => {
                    self.start_pass("deduplicating", self.hash_total)
                }
                Message::Deduplicating(count) => self.add(count),
                Message::StopProgress => {
                    if let Some(mut pass) = self.pass.take() {
                        pass.meter.finish();
                        log::info!("{} completed in {:.2?}", pass.name, pass.started.elapsed());
                    }
                }
                Message::Stop => break,
            }
        }
        if let Some(started) = self.started {
            log::info!("finished in {:.2?}", started.elapsed());
        }
    }
}
