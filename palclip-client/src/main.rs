use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::Duration,
};

use clap::Parser;
use palclip_client::{
    EventBus, FileSettingsStore, MenuAction, Session, WsBackend, WsBackendConfig, settings,
};
use tokio::runtime::Runtime;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug, Clone)]
#[command(name = "palclip")]
struct ClientArgs {
    #[arg(long, default_value = "ws://127.0.0.1:9292/ws")]
    server_url: String,
    /// Directory holding settings and logs. Defaults to the per-user config directory.
    #[arg(long)]
    config_dir: Option<PathBuf>,
    #[arg(long, default_value = "palclip")]
    client_name: String,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

enum UiEvent {
    Line(String),
    InputClosed,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct PalClipApp {
    session: Session,
    keyboard: EventBus<char>,
    ui_event_rx: Receiver<UiEvent>,
    // Declared last so the backend connection is released before the runtime stops.
    _runtime: Runtime,
}

impl PalClipApp {
    fn run(&mut self) {
        self.session.start();
        print_help();

        loop {
            match self.ui_event_rx.recv_timeout(POLL_INTERVAL) {
                Ok(UiEvent::Line(line)) => {
                    if self.handle_line(line.trim_end_matches(['\r', '\n'])) == Flow::Quit {
                        break;
                    }
                }
                Ok(UiEvent::InputClosed) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.session.poll_events() {
                self.render();
            }
            self.show_notices();
        }

        info!("presenter exiting");
    }

    fn handle_line(&mut self, line: &str) -> Flow {
        if let Some(term) = line.strip_prefix('/') {
            self.session.on_search_change(term);
            self.render();
            return Flow::Continue;
        }

        let mut chars = line.chars();
        if let (Some(key @ '0'..='9'), None) = (chars.next(), chars.next()) {
            // Digits travel through the keyboard hub like real key presses.
            self.keyboard.publish(&key);
            return Flow::Continue;
        }

        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (line, ""),
        };

        match command {
            "" => self.render(),
            ":copy" => match self.row_entry(rest) {
                Some(entry) => self.session.on_copy_click(&entry),
                None => println!("no such row: {rest}"),
            },
            ":secret" => match self.row_entry(rest) {
                Some(entry) => self.session.on_mark_secret_click(&entry.hash),
                None => println!("no such row: {rest}"),
            },
            ":clear" => self.session.on_menu_action(MenuAction::Clear),
            ":about" => self.session.on_menu_action(MenuAction::About),
            ":settings" => {
                self.session.on_menu_action(MenuAction::Settings);
                match self.session.on_settings_open() {
                    Ok(Some(text)) => println!("{text}"),
                    Ok(None) => println!("(no settings saved)"),
                    Err(err) => {
                        warn!("settings load failed: {err}");
                        println!("settings unavailable: {err}");
                    }
                }
            }
            ":save" => {
                let text = rest.replace("\\n", "\n");
                match self.session.on_settings_save(&text) {
                    Ok(()) => println!("settings saved"),
                    Err(err) => {
                        error!("settings save failed: {err}");
                        println!("settings not saved: {err}");
                    }
                }
            }
            ":reload" => self.session.reload(),
            ":quit" => {
                self.session.on_menu_action(MenuAction::Quit);
                return Flow::Quit;
            }
            ":help" => print_help(),
            other => println!("unknown command: {other} (:help lists commands)"),
        }

        Flow::Continue
    }

    fn row_entry(&self, index: &str) -> Option<palclip_core::ClipEntry> {
        let index: usize = index.trim().parse().ok()?;
        self.session.view().get(index).cloned()
    }

    fn render(&self) {
        let rows = self.session.rows();
        let stdout = io::stdout();
        let mut out = stdout.lock();

        let _ = writeln!(
            out,
            "-- {} of {} clips (search: {:?}) --",
            rows.len(),
            self.session.entries().len(),
            self.session.search_term()
        );
        for (index, row) in rows.iter().enumerate() {
            let key = row
                .shortcut
                .map(|slot| slot.to_string())
                .unwrap_or_else(|| " ".to_owned());
            let _ = writeln!(
                out,
                "{index:>3} [{key}] {}  {}",
                row.timestamp_label, row.text
            );
        }
        let _ = out.flush();
    }

    fn show_notices(&mut self) {
        for notice in self.session.take_notices() {
            println!("** {} **", notice.text);
        }
    }
}

fn print_help() {
    println!(
        "commands: /<term> search | 0-9 quick copy | :copy N | :secret N | :clear | :settings | :save <text> | :about | :reload | :quit"
    );
}

fn spawn_input_thread(ui_event_tx: Sender<UiEvent>) {
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if ui_event_tx.send(UiEvent::Line(line)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!("stdin read failed: {err}");
                    break;
                }
            }
        }
        let _ = ui_event_tx.send(UiEvent::InputClosed);
    });
}

fn init_logging(config_dir: &Path) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let log_path = client_log_path(config_dir);
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}

fn client_log_path(config_dir: &Path) -> PathBuf {
    let dir = config_dir.join("logs");
    let _ = std::fs::create_dir_all(&dir);
    dir.join("palclip.log")
}

fn main() {
    let args = ClientArgs::parse();
    let config_dir = args.config_dir.clone().unwrap_or_else(settings::config_dir);
    init_logging(&config_dir);

    info!(
        server_url = %args.server_url,
        client_name = %args.client_name,
        config_dir = %config_dir.display(),
        "palclip starting"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let backend = match WsBackend::connect(
        runtime.handle(),
        WsBackendConfig {
            server_url: args.server_url.clone(),
            client_name: args.client_name.clone(),
        },
    ) {
        Ok(backend) => backend,
        Err(err) => {
            error!("backend setup failed: {err}");
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let (ui_event_tx, ui_event_rx) = mpsc::channel::<UiEvent>();
    spawn_input_thread(ui_event_tx);

    let keyboard = EventBus::<char>::new();
    let session = Session::new(
        Arc::new(backend),
        Box::new(FileSettingsStore::new(&config_dir)),
        keyboard.clone(),
    );

    let mut app = PalClipApp {
        session,
        keyboard,
        ui_event_rx,
        _runtime: runtime,
    };
    app.run();
}
