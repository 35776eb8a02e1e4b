use std::path::PathBuf;
use std::process::ExitCode;

use nfcapp::capture::SignalCapture;
use nfcapp::monitor::{FrameAdapter, NfcMonitor};
use nfcapp::receiver::SignalReceiver;
use nfcapp::wav::WavFileSource;
use nfccore::decoder::DecoderConfig;
use nfccore::protocol::NfcFrame;

struct PrintFrames;

impl FrameAdapter for PrintFrames {
    fn frame_received(&self, frame: NfcFrame) {
        let payload: Vec<String> = frame
            .payload()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        println!(
            "{:>10}..{:<10} {:?} {:?} {:?} flags {:#04x} : {}",
            frame.frame_start,
            frame.frame_end,
            frame.tech_type,
            frame.rate_type,
            frame.direction,
            frame.flags,
            payload.join(" ")
        );
    }
}

fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        return Err("usage: nfcrt-decode <capture.wav> [--capture <dir>]".into());
    };
    let capture_dir = match args.next().as_deref() {
        Some("--capture") => Some(PathBuf::from(
            args.next()
                .ok_or_else(|| "--capture needs a directory".to_string())?,
        )),
        Some(other) => return Err(format!("unknown argument: {}", other)),
        None => None,
    };

    let source = WavFileSource::new(PathBuf::from(&path)).map_err(|e| e.to_string())?;
    let config = DecoderConfig {
        sample_rate: source.sample_rate(),
        ..DecoderConfig::default()
    };
    let capture = match capture_dir {
        Some(dir) => Some(SignalCapture::new(&dir, config.sample_rate).map_err(|e| e.to_string())?),
        None => None,
    };

    let receiver = SignalReceiver::new(source, config, capture);
    let monitor = NfcMonitor::new(receiver);
    monitor.add_frame_adapter(PrintFrames);
    monitor.start().map_err(|e| e.to_string())?;
    monitor.wait();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}
