//! Line commands read from stdin

use loopdeck_audio::TrackId;
use std::path::PathBuf;

/// A parsed control command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load(TrackId, PathBuf),
    Play(TrackId),
    Stop(TrackId),
    Loop(TrackId, bool),
    Tempo(TrackId, f32),
    Pitch(TrackId, f32),
    Gain(TrackId, f32),
    Master(f32),
    Segment(TrackId, f64, f64),
    /// Press at `x`, move to `to`, release, in a view `width` pixels wide
    Drag {
        track: TrackId,
        x: f64,
        width: f64,
        to: f64,
    },
    Toggle,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  load <track> <path>            decode a file onto a track
  play <track> | stop <track>    start or pause one track
  loop <track> on|off            toggle looping
  tempo <track> <x>              tempo multiplier (0.25 - 4)
  pitch <track> <semitones>      pitch shift (-12 - 12)
  gain <track> <x>               track gain (0 - 2)
  master <x>                     master gain (0 - 2)
  segment <track> <start> <end>  loop region in seconds
  drag <track> <x> <width> <to>  drag the marker under x to another pixel
  toggle                         play all / stop all
  status                         show every track
  quit";

/// Parse one input line. Returns `None` for anything unrecognised.
pub fn parse_command(line: &str) -> Option<Command> {
    let input = line.trim();

    match input {
        "q" | "quit" | "exit" => return Some(Command::Quit),
        "toggle" | "t" => return Some(Command::Toggle),
        "status" | "s" => return Some(Command::Status),
        "help" | "?" => return Some(Command::Help),
        _ => {}
    }

    // Load takes the rest of the line as a path, quoted or not
    if let Some(rest) = input.strip_prefix("load ") {
        let (track, path) = rest.trim().split_once(char::is_whitespace)?;
        let track = track.parse().ok()?;
        let path = path.trim();
        let path = if (path.starts_with('\'') && path.ends_with('\''))
            || (path.starts_with('"') && path.ends_with('"'))
        {
            &path[1..path.len() - 1]
        } else {
            path
        };
        if path.is_empty() {
            return None;
        }
        return Some(Command::Load(track, path.into()));
    }

    let words: Vec<&str> = input.split_whitespace().collect();
    let track = |i: usize| words.get(i)?.parse::<TrackId>().ok();
    let num = |i: usize| words.get(i)?.parse::<f64>().ok();

    let command = match words.as_slice() {
        ["play", _] => Command::Play(track(1)?),
        ["stop", _] => Command::Stop(track(1)?),
        ["loop", _, "on"] => Command::Loop(track(1)?, true),
        ["loop", _, "off"] => Command::Loop(track(1)?, false),
        ["tempo", _, _] => Command::Tempo(track(1)?, num(2)? as f32),
        ["pitch", _, _] => Command::Pitch(track(1)?, num(2)? as f32),
        ["gain", _, _] => Command::Gain(track(1)?, num(2)? as f32),
        ["master", _] => Command::Master(num(1)? as f32),
        ["segment", _, _, _] => Command::Segment(track(1)?, num(2)?, num(3)?),
        ["drag", _, _, _, _] => Command::Drag {
            track: track(1)?,
            x: num(2)?,
            width: num(3)?,
            to: num(4)?,
        },
        _ => return None,
    };
    Some(command)
}
