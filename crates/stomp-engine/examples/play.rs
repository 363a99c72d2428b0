//! Minimal engine wiring: load a drumset and a song, play, log status.
//!
//! The real pedal front-end lives outside this crate; this just shows the
//! Player lifecycle end to end.

use std::env;
use std::process::ExitCode;

use stomp_engine::{Player, StatusEvent};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let (Some(drumset), Some(song)) = (args.next(), args.next()) else {
        eprintln!("usage: play <drumset.drm> <song.bbs> [effects-dir]");
        return ExitCode::FAILURE;
    };

    let mut player = Player::new();
    player.set_drumset(drumset);
    player.set_song(song);
    if let Some(effects) = args.next() {
        player.set_effects_path(effects);
    }

    let events = player.status_events();
    player.play();

    let mut failed = false;
    for event in events.iter() {
        println!("{event:?}");
        match event {
            StatusEvent::Error(_) => failed = true,
            StatusEvent::Stopped => break,
            _ => {}
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
