use std::path::{Path, PathBuf};
use std::sync::Arc;

use demix::{ConfigUpdate, SaveOptions, Separator};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| "mix.wav".into());
    let out = PathBuf::from(args.next().unwrap_or_else(|| "./separated".into()));
    let model = args.next().unwrap_or_else(|| "demix_4s".into());

    let update = ConfigUpdate {
        progress: Some(true),
        callback: Some(Arc::new(|payload| {
            if payload.get("state").and_then(|v| v.as_str()) != Some("end") {
                return;
            }
            if let (Some(offset), Some(length)) = (
                payload.get("segment_offset").and_then(|v| v.as_u64()),
                payload.get("audio_length").and_then(|v| v.as_u64()),
            ) {
                eprint!("\rSeparating: {}/{}", offset, length);
            }
        })),
        ..Default::default()
    };

    let separator = Separator::new(&model, None, update)?;
    let result = separator.separate_file(Path::new(&input))?;
    eprintln!();

    std::fs::create_dir_all(&out)?;
    let opts = SaveOptions::default();
    for (name, stem) in &result.sources {
        let path = out.join(format!("{}.wav", name));
        demix::save_audio(stem, &path, separator.samplerate(), &opts)?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}
