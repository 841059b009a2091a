use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use midikeys::{
    CommandProbe, LogEmitter, ManualProbe, PlaybackState, PlayerHandle, PlayerUpdate, Settings,
    Timeline, TrackSelection, WindowProbe, WindowStatus, spawn_player,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SEEK_STEP_MS: u64 = 5_000;

struct Args {
    score: PathBuf,
    config: PathBuf,
    track: Option<u32>,
    no_focus_check: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut score = None;
    let mut config = PathBuf::from("midikeys.ron");
    let mut track = None;
    let mut no_focus_check = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = args.next().ok_or("--config needs a path")?.into(),
            "--track" => {
                let value = args.next().ok_or("--track needs an index")?;
                track = Some(value.parse().map_err(|_| format!("bad track index {value}"))?);
            }
            "--no-focus-check" => no_focus_check = true,
            _ if score.is_none() => score = Some(PathBuf::from(arg)),
            _ => return Err(format!("unexpected argument {arg}")),
        }
    }

    Ok(Args {
        score: score.ok_or("usage: midikeys <file.mid> [--config path] [--track n] [--no-focus-check]")?,
        config,
        track,
        no_focus_check,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("midikeys=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let settings = Settings::load(&args.config)?;
    let timeline = Timeline::load(&args.score)?;

    let probe: Arc<dyn WindowProbe> = if args.no_focus_check {
        Arc::new(ManualProbe::new(WindowStatus::Active))
    } else {
        Arc::new(CommandProbe::new(settings.probe_program.clone()))
    };

    let player = spawn_player(&settings, Box::new(LogEmitter), probe);
    player.load(timeline)?;

    let selection = args.track.map_or(TrackSelection::All, TrackSelection::Solo);
    println!("-  play/pause   =  stop   up/down  track   left/right  seek   esc  quit");

    terminal::enable_raw_mode()?;
    let result = console(&player, selection);
    terminal::disable_raw_mode()?;

    player.shutdown();
    result
}

fn console(player: &PlayerHandle, selection: TrackSelection) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        while let Ok(update) = player.updates.try_recv() {
            print_update(&update);
        }
        let _ = std::io::stdout().flush();

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let result = match key.code {
            KeyCode::Char('-') => match player.status()?.state {
                PlaybackState::Stopped => player.play(selection),
                PlaybackState::Playing => player.pause(),
                PlaybackState::Paused => player.resume(),
            },
            KeyCode::Char('=') => player.stop(),
            KeyCode::Up => player.previous_track(),
            KeyCode::Down => player.next_track(),
            KeyCode::Left => {
                let position = player.status()?.position_ms;
                player.seek(position.saturating_sub(SEEK_STEP_MS))
            }
            KeyCode::Right => {
                let position = player.status()?.position_ms;
                player.seek(position + SEEK_STEP_MS)
            }
            KeyCode::Esc => {
                let _ = player.stop();
                return Ok(());
            }
            _ => continue,
        };

        if let Err(e) = result {
            print!("! {e}\r\n");
        }
    }
}

fn print_update(update: &PlayerUpdate) {
    match update {
        PlayerUpdate::ScoreLoaded {
            tracks,
            duration_ms,
            transposition,
        } => {
            print!(
                "loaded {} tracks, {:.1} s, transposition {}\r\n",
                tracks.len(),
                *duration_ms as f64 / 1000.0,
                transposition
            );
            for track in tracks {
                print!("  [{}] {} ({} notes)\r\n", track.index, track.name, track.note_count);
            }
        }
        PlayerUpdate::StateChanged { state, reason } => match reason {
            Some(reason) => print!("{state} ({reason:?})\r\n"),
            None => print!("{state}\r\n"),
        },
        PlayerUpdate::TrackChanged { selection } => print!("track: {selection:?}\r\n"),
        PlayerUpdate::Progress {
            position_ms,
            duration_ms,
            ..
        } => print!(
            "\r{:>6.1} / {:.1} s",
            *position_ms as f64 / 1000.0,
            *duration_ms as f64 / 1000.0
        ),
        PlayerUpdate::TargetLost { closed: true } => print!("\r\ntarget window closed\r\n"),
        PlayerUpdate::TargetLost { closed: false } => print!("\r\ntarget window lost focus\r\n"),
        PlayerUpdate::TargetRegained => print!("target window back\r\n"),
    }
}
