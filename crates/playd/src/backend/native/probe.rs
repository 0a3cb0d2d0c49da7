//! Metadata probe: a decode-only pass over the start of a file.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use playproto::{TagList, TagValue};
use symphonia::core::meta::{MetadataRevision, StandardTagKey, Tag, Value};
use tracing::debug;

use super::decode::Media;
use crate::backend::{BackendError, Probe, ProbeMessage};

pub struct NativeProbe {
    rx: mpsc::Receiver<ProbeMessage>,
}

impl NativeProbe {
    /// Start probing `path` on a worker thread. The thread exits on its own
    /// after preroll or an error, or as soon as the probe is dropped.
    pub fn spawn(uri: &str, path: PathBuf) -> Result<Self, BackendError> {
        let (tx, rx) = mpsc::channel();
        let uri = uri.to_string();
        thread::Builder::new()
            .name("playd-probe".to_string())
            .spawn(move || run(&uri, path, tx))?;
        Ok(Self { rx })
    }
}

impl Probe for NativeProbe {
    fn next_message(&mut self, timeout: Option<Duration>) -> Option<ProbeMessage> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).ok(),
            None => self.rx.recv().ok(),
        }
    }
}

fn run(uri: &str, path: PathBuf, tx: mpsc::Sender<ProbeMessage>) {
    let mut media = match Media::open(&path) {
        Ok(media) => media,
        Err(e) => {
            let _ = tx.send(ProbeMessage::Error(format!(
                "Could not open {}: {:#}",
                uri, e
            )));
            return;
        }
    };

    // a send error means the probe was dropped; stop early
    if tx.send(ProbeMessage::Tags(stream_tags(&media))).is_err() {
        return;
    }

    let mut revisions: Vec<TagList> = Vec::new();
    if let Some(metadata) = media.probed.get() {
        if let Some(rev) = metadata.current() {
            revisions.push(revision_tags(rev));
        }
    }
    if let Some(rev) = media.format.metadata().current() {
        revisions.push(revision_tags(rev));
    }
    for tags in revisions.into_iter().filter(|t| !t.is_empty()) {
        if tx.send(ProbeMessage::Tags(tags)).is_err() {
            return;
        }
    }

    let done = match media.next_samples() {
        Ok(Some(_)) => ProbeMessage::PrerollDone,
        Ok(None) => ProbeMessage::Error(format!("No audio data in {}", uri)),
        Err(e) => ProbeMessage::Error(format!("Error decoding {}: {:#}", uri, e)),
    };
    debug!("probe of {} finished", uri);
    let _ = tx.send(done);
}

/// Codec and layout of the selected track.
fn stream_tags(media: &Media) -> TagList {
    let mut tags: TagList = Vec::new();
    let params = media
        .format
        .tracks()
        .iter()
        .find(|t| t.id == media.track_id)
        .map(|t| &t.codec_params);

    if let Some(params) = params {
        if let Some(codec) = symphonia::default::get_codecs().get_codec(params.codec) {
            tags.push((
                "audio-codec".to_string(),
                vec![TagValue::Str(codec.short_name.to_string())],
            ));
        }
        if let Some(frames) = params.n_frames {
            let seconds = frames as f64 / media.spec.sample_rate as f64;
            tags.push(("duration".to_string(), vec![TagValue::Float(seconds)]));
        }
    }
    tags.push((
        "sample-rate".to_string(),
        vec![TagValue::UInt(media.spec.sample_rate as u64)],
    ));
    tags.push((
        "channels".to_string(),
        vec![TagValue::UInt(media.spec.channels as u64)],
    ));
    tags
}

fn revision_tags(rev: &MetadataRevision) -> TagList {
    let mut list: TagList = Vec::new();
    for tag in rev.tags() {
        let key = tag_key(tag);
        let value = tag_value(&key, &tag.value);
        match list.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => list.push((key, vec![value])),
        }
    }
    list
}

fn tag_key(tag: &Tag) -> String {
    let known = match tag.std_key {
        Some(StandardTagKey::TrackTitle) => "title",
        Some(StandardTagKey::Artist) => "artist",
        Some(StandardTagKey::Album) => "album",
        Some(StandardTagKey::AlbumArtist) => "album-artist",
        Some(StandardTagKey::Composer) => "composer",
        Some(StandardTagKey::Date) => "date",
        Some(StandardTagKey::Genre) => "genre",
        Some(StandardTagKey::TrackNumber) => "track-number",
        Some(StandardTagKey::Comment) => "comment",
        _ => "",
    };
    if known.is_empty() {
        tag.key.to_lowercase()
    } else {
        known.to_string()
    }
}

fn tag_value(key: &str, value: &Value) -> TagValue {
    match value {
        Value::String(s) if key == "date" => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(TagValue::Date)
            .unwrap_or_else(|_| TagValue::Str(s.clone())),
        Value::String(s) => TagValue::Str(s.clone()),
        Value::UnsignedInt(v) => TagValue::UInt(*v),
        Value::SignedInt(v) => TagValue::Int(*v),
        Value::Float(v) => TagValue::Float(*v),
        Value::Boolean(v) => TagValue::Bool(*v),
        Value::Flag => TagValue::Bool(true),
        Value::Binary(bytes) => TagValue::Binary(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_date_values_are_parsed() {
        assert_eq!(
            tag_value("date", &Value::String("2004-05-17".to_string())),
            TagValue::Date(NaiveDate::from_ymd_opt(2004, 5, 17).unwrap())
        );
        assert_eq!(
            tag_value("date", &Value::String("2004".to_string())),
            TagValue::Str("2004".to_string())
        );
        assert_eq!(tag_value("x", &Value::Flag), TagValue::Bool(true));
    }

    fn write_wav(path: &Path) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..44_100 * 2 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_probe_reports_stream_then_preroll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one-second.wav");
        write_wav(&path);

        let mut probe = NativeProbe::spawn("one-second.wav", path).unwrap();
        let timeout = Some(Duration::from_secs(5));

        let Some(ProbeMessage::Tags(tags)) = probe.next_message(timeout) else {
            panic!("expected stream tags first");
        };
        assert!(tags.contains(&("sample-rate".to_string(), vec![TagValue::UInt(44_100)])));
        assert!(tags.contains(&("channels".to_string(), vec![TagValue::UInt(2)])));

        let mut last = None;
        while let Some(message) = probe.next_message(timeout) {
            last = Some(message);
        }
        assert_eq!(last, Some(ProbeMessage::PrerollDone));
    }

    #[test]
    fn test_silent_probe_times_out_then_ends_when_worker_exits() {
        let (tx, rx) = mpsc::channel();
        let mut probe = NativeProbe { rx };

        let started = std::time::Instant::now();
        assert_eq!(probe.next_message(Some(Duration::from_millis(50))), None);
        assert!(started.elapsed() >= Duration::from_millis(50));

        drop(tx);
        assert_eq!(probe.next_message(None), None);
    }

    #[test]
    fn test_probe_of_missing_file_errors() {
        let mut probe = NativeProbe::spawn("gone.ogg", PathBuf::from("/nonexistent/gone.ogg")).unwrap();
        match probe.next_message(Some(Duration::from_secs(5))) {
            Some(ProbeMessage::Error(text)) => assert!(text.starts_with("Could not open gone.ogg")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
