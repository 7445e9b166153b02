//! Wire frame decoding.
//!
//! ```text
//! NAME=VALUE\0NAME=VALUE\0\0<body>
//! ```
//!
//! Tolerant reader: frames without the `\0\0` separator or without a
//! `SERF_EVENT` line decode to `None` and are dropped by the caller.

use super::types::Event;

/// Marks the end of the environment section of a frame.
pub const FRAME_SEPARATOR: &[u8] = b"\0\0";

/// Decode one frame received from the event handler helper.
pub fn decode(raw: &[u8]) -> Option<Event> {
    let split = raw
        .windows(FRAME_SEPARATOR.len())
        .position(|window| window == FRAME_SEPARATOR)?;
    let env_section = String::from_utf8_lossy(&raw[..split]);
    let body = raw[split + FRAME_SEPARATOR.len()..].to_vec();

    let env = env_section
        .split('\0')
        .filter_map(|line| line.split_once('='));

    Event::from_env(env, body)
}

/// Encode environment lines and a body into a frame, as the helper does.
pub fn encode_frame<'a, I>(env: I, body: &[u8]) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut frame = Vec::with_capacity(body.len() + 64);
    for (name, value) in env {
        frame.extend_from_slice(name.as_bytes());
        frame.push(b'=');
        frame.extend_from_slice(value.as_bytes());
        frame.push(0);
    }
    frame.push(0);
    frame.extend_from_slice(body);
    frame
}
