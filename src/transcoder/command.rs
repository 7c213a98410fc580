//! Transcoder command construction: argv and `filter_complex` graph.
//!
//! Grounded in `original_source/backend/services/ffmpeg_manager.py`'s
//! `_build_ffmpeg_command`/`_build_filter_complex`. Resolves the spec's open
//! question on loop-relative overlay enables in favor of `mod(t, D)` for
//! looped timelines, as the spec mandates.

use std::path::PathBuf;

/// Encoder parameters resolved from the hardware probe and the timeline's
/// target resolution/frame rate.
#[derive(Debug, Clone)]
pub struct EncodingProfile {
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A prefetched, pixel-positioned overlay ready to be baked into the filter
/// graph, as emitted by the Overlay Prefetcher (C5).
#[derive(Debug, Clone)]
pub struct TimedOverlay {
    pub path: PathBuf,
    pub x_px: i64,
    pub y_px: i64,
    pub opacity: f64,
    pub start_s: f64,
    pub end_s: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub asset_id: i64,
}

/// Everything needed to (re)spawn a transcoder for a given stream id.
#[derive(Debug, Clone)]
pub struct StartParams {
    pub stream_id: i64,
    pub input_url: String,
    pub output_urls: Vec<String>,
    pub profile: EncodingProfile,
    pub timed_overlays: Vec<TimedOverlay>,
    pub timeline_duration: f64,
    pub loop_flag: bool,
}

/// Builds the full argv (minus the binary itself) for this start/restart.
pub fn build_args(encoder_tag: &str, params: &StartParams) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into()];

    if params.input_url.starts_with("rtsp://") {
        args.extend(
            ["-rtsp_transport", "tcp", "-timeout", "5000000"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    args.extend(["-re".into(), "-i".into(), params.input_url.clone()]);

    // Silent audio source: guarantees an audio track regardless of camera
    // audio availability (preserved per SPEC_FULL.md §9 open-question 2).
    args.extend([
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "anullsrc=channel_layout=stereo:sample_rate=44100".into(),
    ]);

    for overlay in &params.timed_overlays {
        args.extend([
            "-loop".into(),
            "1".into(),
            "-i".into(),
            overlay.path.to_string_lossy().into_owned(),
        ]);
    }

    args.extend(["-filter_complex".into(), build_filter_complex(params)]);
    args.extend(["-map".into(), "[vout]".into(), "-map".into(), "1:a".into()]);

    args.extend(["-c:v".into(), encoder_tag.to_string()]);
    args.extend([
        "-b:v".into(),
        format!("{}k", params.profile.bitrate_kbps),
        "-bufsize".into(),
        format!("{}k", params.profile.bitrate_kbps * 2),
        "-g".into(),
        (params.profile.fps * 2).to_string(),
    ]);
    args.extend([
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-ar".into(),
        "44100".into(),
    ]);
    args.extend(["-f".into(), "flv".into()]);

    if params.output_urls.len() <= 1 {
        if let Some(url) = params.output_urls.first() {
            args.push(url.clone());
        }
    } else {
        let targets = params
            .output_urls
            .iter()
            .map(|u| format!("[f=flv]{u}"))
            .collect::<Vec<_>>()
            .join("|");
        args.extend(["-f".into(), "tee".into(), targets]);
    }

    args
}

fn build_filter_complex(params: &StartParams) -> String {
    let mut parts = Vec::new();
    let (w, h) = (params.profile.width, params.profile.height);
    parts.push(format!(
        "[0:v]scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setpts=PTS-STARTPTS[base]"
    ));

    let mut last_label = "base".to_string();
    let count = params.timed_overlays.len();
    for (i, overlay) in params.timed_overlays.iter().enumerate() {
        let input_idx = i + 2; // 0 = camera video, 1 = silent audio, 2.. = overlay stills
        let scaled = format!("ov{i}");
        match (overlay.width, overlay.height) {
            (Some(w), Some(h)) => parts.push(format!(
                "[{input_idx}:v]scale={w}:{h},format=rgba,colorchannelmixer=aa={opacity}[{scaled}]",
                opacity = overlay.opacity
            )),
            _ => parts.push(format!(
                "[{input_idx}:v]format=rgba,colorchannelmixer=aa={opacity}[{scaled}]",
                opacity = overlay.opacity
            )),
        }

        let enable = enable_expr(overlay.start_s, overlay.end_s, params.timeline_duration, params.loop_flag);
        let out_label = if i + 1 == count { "vout".to_string() } else { format!("c{i}") };
        parts.push(format!(
            "[{last_label}][{scaled}]overlay={x}:{y}:enable='{enable}'[{out_label}]",
            x = overlay.x_px,
            y = overlay.y_px
        ));
        last_label = out_label;
    }

    if params.timed_overlays.is_empty() {
        parts.push("[base]copy[vout]".into());
    }

    parts.join(";")
}

/// Per §4.2: for a looped timeline the enable window must be expressed in
/// loop-relative time via `mod(t, D)`, else overlays never re-trigger past
/// the first loop.
fn enable_expr(start_s: f64, end_s: f64, duration: f64, loop_flag: bool) -> String {
    if loop_flag {
        format!("between(mod(t,{duration}),{start_s},{end_s})")
    } else {
        format!("between(t,{start_s},{end_s})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> EncodingProfile {
        EncodingProfile { bitrate_kbps: 4000, width: 1920, height: 1080, fps: 30 }
    }

    #[test]
    fn looped_overlay_uses_mod_duration() {
        let params = StartParams {
            stream_id: 1,
            input_url: "rtmp://127.0.0.1:1935/live/camera_7".into(),
            output_urls: vec!["rtmp://preview/live".into()],
            profile: profile(),
            timed_overlays: vec![TimedOverlay {
                path: "/tmp/o.png".into(),
                x_px: 10,
                y_px: 20,
                opacity: 1.0,
                start_s: 10.0,
                end_s: 20.0,
                width: None,
                height: None,
                asset_id: 9,
            }],
            timeline_duration: 30.0,
            loop_flag: true,
        };
        let filter = build_filter_complex(&params);
        assert!(filter.contains("enable='between(mod(t,30),10,20)'"));
    }

    #[test]
    fn non_looped_overlay_uses_plain_between() {
        let params = StartParams {
            stream_id: 1,
            input_url: "rtmp://127.0.0.1:1935/live/camera_7".into(),
            output_urls: vec!["rtmp://preview/live".into()],
            profile: profile(),
            timed_overlays: vec![TimedOverlay {
                path: "/tmp/o.png".into(),
                x_px: 10,
                y_px: 20,
                opacity: 1.0,
                start_s: 10.0,
                end_s: 20.0,
                width: None,
                height: None,
                asset_id: 9,
            }],
            timeline_duration: 30.0,
            loop_flag: false,
        };
        let filter = build_filter_complex(&params);
        assert!(filter.contains("enable='between(t,10,20)'"));
    }

    #[test]
    fn multiple_outputs_use_tee_muxer() {
        let params = StartParams {
            stream_id: 1,
            input_url: "rtmp://127.0.0.1:1935/live/camera_1".into(),
            output_urls: vec!["rtmp://a/k1".into(), "rtmp://b/k2".into()],
            profile: profile(),
            timed_overlays: vec![],
            timeline_duration: 60.0,
            loop_flag: false,
        };
        let args = build_args("libx264", &params);
        let joined = args.join(" ");
        assert!(joined.contains("-f tee"));
        assert!(joined.contains("[f=flv]rtmp://a/k1|[f=flv]rtmp://b/k2"));
    }

    #[test]
    fn rtsp_input_forces_tcp_transport() {
        let params = StartParams {
            stream_id: 1,
            input_url: "rtsp://cam1/stream".into(),
            output_urls: vec!["rtmp://a/k".into()],
            profile: profile(),
            timed_overlays: vec![],
            timeline_duration: 60.0,
            loop_flag: false,
        };
        let args = build_args("libx264", &params);
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
    }
}
