//! Cover-art acquisition and preparation.
//!
//! Fetching and decoding run in the service loop through [`ArtLoader`];
//! the render context owns a [`Rescaler`] and converts the decoded bitmap to
//! the panel's RGB565 format on a worker task.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use image::{Rgb, RgbImage};
use reqwest::{Client, ClientBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::state::FALLBACK_BACKGROUND;
use crate::DeviceError;

/// Luma above which the art counts as bright.
const BRIGHT_LUMA: f32 = 186.0;
/// Luma below which the art counts as dark.
const DARK_LUMA: f32 = 40.0;
const PALETTE_SIZE: usize = 5;
const MAX_SAMPLES: usize = 4_096;
const MAX_ITER: usize = 10;

/// Where cover-art bytes come from.
pub trait ArtSource: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, DeviceError>>;
}

/// HTTPS source. Certificates are not verified; the art CDN is reached from
/// a device without a trust store.
#[derive(Debug, Clone)]
pub struct HttpArtSource {
    client: Client,
    stall_timeout: Duration,
    max_bytes: usize,
}

impl HttpArtSource {
    pub fn new(stall_timeout: Duration, max_bytes: usize) -> Result<Self, DeviceError> {
        let client = ClientBuilder::new()
            .danger_accept_invalid_certs(true)
            .connect_timeout(stall_timeout)
            .build()?;
        Ok(Self {
            client,
            stall_timeout,
            max_bytes,
        })
    }
}

impl ArtSource for HttpArtSource {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, DeviceError>> {
        Box::pin(async move {
            // A server that accepts and never answers counts as a stall too.
            let response = tokio::time::timeout(self.stall_timeout, self.client.get(url).send())
                .await
                .map_err(|_| DeviceError::DownloadStalled(self.stall_timeout))??
                .error_for_status()?;
            let declared = response
                .content_length()
                .ok_or(DeviceError::MissingContentLength)?;
            let declared = usize::try_from(declared).unwrap_or(usize::MAX);
            trace!(url, declared, "Downloading art");
            collect_body(
                response.bytes_stream(),
                declared,
                self.max_bytes,
                self.stall_timeout,
            )
            .await
        })
    }
}

/// Read `stream` into a buffer sized for `declared` bytes.
///
/// A declared length above `max_len` is refused before anything is
/// allocated. The stall timer restarts after every chunk. Anything other
/// than exactly `declared` bytes is an error and the partial buffer is
/// dropped.
pub async fn collect_body<S, E>(
    stream: S,
    declared: usize,
    max_len: usize,
    stall_timeout: Duration,
) -> Result<Vec<u8>, DeviceError>
where
    S: Stream<Item = Result<Bytes, E>>,
    DeviceError: From<E>,
{
    if declared > max_len {
        return Err(DeviceError::ArtTooLarge {
            declared,
            limit: max_len,
        });
    }
    futures::pin_mut!(stream);
    let mut buffer = BytesMut::with_capacity(declared);

    loop {
        let next = tokio::time::timeout(stall_timeout, stream.next())
            .await
            .map_err(|_| DeviceError::DownloadStalled(stall_timeout))?;
        match next {
            Some(chunk) => {
                let chunk = chunk?;
                if buffer.len() + chunk.len() > declared {
                    return Err(DeviceError::IncompleteDownload {
                        expected: declared,
                        received: buffer.len() + chunk.len(),
                    });
                }
                buffer.extend_from_slice(&chunk);
            }
            None => break,
        }
    }

    if buffer.len() != declared {
        return Err(DeviceError::IncompleteDownload {
            expected: declared,
            received: buffer.len(),
        });
    }
    Ok(Vec::from(buffer))
}

/// Decode JPEG or PNG bytes into a native-size RGB bitmap.
pub fn decode_art(bytes: &[u8]) -> Result<RgbImage, DeviceError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

fn luma(c: [f32; 3]) -> f32 {
    0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2]
}

fn to_rgb(c: [f32; 3]) -> Rgb<u8> {
    Rgb([
        c[0].clamp(0.0, 255.0).round() as u8,
        c[1].clamp(0.0, 255.0).round() as u8,
        c[2].clamp(0.0, 255.0).round() as u8,
    ])
}

fn mix(c: [f32; 3], toward: f32, amount: f32) -> [f32; 3] {
    [
        c[0] + (toward - c[0]) * amount,
        c[1] + (toward - c[1]) * amount,
        c[2] + (toward - c[2]) * amount,
    ]
}

fn sample_pixels(image: &RgbImage) -> Vec<[f32; 3]> {
    let total = (image.width() as usize) * (image.height() as usize);
    if total == 0 {
        return Vec::new();
    }
    let step = (total / MAX_SAMPLES).max(1);
    image
        .pixels()
        .step_by(step)
        .take(MAX_SAMPLES)
        .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
        .collect()
}

fn squared_distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    dr * dr + dg * dg + db * db
}

// Plain k-means seeded from evenly spaced samples. Empty clusters are dropped.
fn palette(samples: &[[f32; 3]], k: usize) -> Vec<[f32; 3]> {
    if samples.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(samples.len());
    let mut centroids: Vec<[f32; 3]> = (0..k).map(|i| samples[i * samples.len() / k]).collect();
    let mut counts = vec![0usize; k];

    for _ in 0..MAX_ITER {
        let mut sums = vec![[0f32; 3]; k];
        counts.iter_mut().for_each(|c| *c = 0);

        for sample in samples {
            let best = centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, squared_distance(sample, c)))
                .fold((0, f32::MAX), |acc, cur| if cur.1 < acc.1 { cur } else { acc })
                .0;
            for channel in 0..3 {
                sums[best][channel] += sample[channel];
            }
            counts[best] += 1;
        }

        let mut changed = false;
        for i in 0..k {
            if counts[i] == 0 {
                continue;
            }
            let n = counts[i] as f32;
            let next = [sums[i][0] / n, sums[i][1] / n, sums[i][2] / n];
            if squared_distance(&centroids[i], &next) > 1e-2 {
                changed = true;
            }
            centroids[i] = next;
        }
        if !changed {
            break;
        }
    }

    centroids
        .into_iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(c, _)| c)
        .collect()
}

/// Background colour to draw behind `image`.
///
/// The average colour is used as-is unless its luma is above the bright
/// threshold (then the darkest palette entry, pulled halfway to black) or
/// below the dark threshold (the lightest entry, pulled halfway to white).
pub fn background_color(image: &RgbImage) -> Rgb<u8> {
    let samples = sample_pixels(image);
    if samples.is_empty() {
        return FALLBACK_BACKGROUND;
    }

    let n = samples.len() as f32;
    let average = samples.iter().fold([0f32; 3], |acc, s| {
        [acc[0] + s[0] / n, acc[1] + s[1] / n, acc[2] + s[2] / n]
    });
    let average_luma = luma(average);

    if average_luma <= BRIGHT_LUMA && average_luma >= DARK_LUMA {
        return to_rgb(average);
    }

    let colors = palette(&samples, PALETTE_SIZE);
    let by_luma = |a: &&[f32; 3], b: &&[f32; 3]| luma(**a).total_cmp(&luma(**b));
    let picked = if average_luma > BRIGHT_LUMA {
        colors.iter().min_by(by_luma).map(|c| mix(*c, 0.0, 0.5))
    } else {
        colors.iter().max_by(by_luma).map(|c| mix(*c, 255.0, 0.5))
    };
    trace!(average_luma, ?picked, "Derived background");
    picked.map(to_rgb).unwrap_or(FALLBACK_BACKGROUND)
}

/// Pack an RGB888 pixel into RGB565.
pub fn rgb565(p: Rgb<u8>) -> u16 {
    ((p[0] as u16 >> 3) << 11) | ((p[1] as u16 >> 2) << 5) | (p[2] as u16 >> 3)
}

/// Square RGB565 destination that survives between albums.
#[derive(Debug, Default)]
pub struct Rescaler {
    buffer: Vec<u16>,
    size: u32,
}

impl Rescaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Last rescaled frame.
    pub fn pixels(&self) -> &[u16] {
        &self.buffer
    }

    /// Fit `image` into a `target`×`target` square, centred on black.
    ///
    /// Nearest-neighbour with `scale = target / max(w, h)`. The buffer is
    /// only reallocated when `target` changes.
    pub fn rescale(&mut self, image: &RgbImage, target: u32) -> &[u16] {
        let side = target as usize;
        if self.size != target || self.buffer.len() != side * side {
            debug!(target, "Allocating art buffer");
            self.buffer = vec![0u16; side * side];
            self.size = target;
        } else {
            self.buffer.iter_mut().for_each(|p| *p = 0);
        }

        let (w, h) = image.dimensions();
        if w == 0 || h == 0 || target == 0 {
            return &self.buffer;
        }

        let scale = target as f32 / w.max(h) as f32;
        let dst_w = ((w as f32 * scale).round() as u32).clamp(1, target);
        let dst_h = ((h as f32 * scale).round() as u32).clamp(1, target);
        let off_x = (target - dst_w) / 2;
        let off_y = (target - dst_h) / 2;

        for dy in 0..dst_h {
            let sy = ((dy as f32 / scale) as u32).min(h - 1);
            let row = (off_y + dy) as usize * side;
            for dx in 0..dst_w {
                let sx = ((dx as f32 / scale) as u32).min(w - 1);
                self.buffer[row + (off_x + dx) as usize] = rgb565(*image.get_pixel(sx, sy));
            }
        }
        &self.buffer
    }
}

/// Decoded art ready for publication.
#[derive(Debug, Clone)]
pub struct LoadedArt {
    pub image: Arc<RgbImage>,
    /// Present when the caller asked for it (new album).
    pub background: Option<Rgb<u8>>,
}

/// Fetch-and-decode front end used by the account manager.
#[derive(Clone)]
pub struct ArtLoader {
    source: Arc<dyn ArtSource>,
}

impl ArtLoader {
    pub fn new(source: Arc<dyn ArtSource>) -> Self {
        Self { source }
    }

    pub async fn load(&self, url: &str, with_background: bool) -> Result<LoadedArt, DeviceError> {
        let bytes = match self.source.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url, error = %e, "Art download failed");
                return Err(e);
            }
        };
        debug!(url, len = bytes.len(), "Art downloaded");

        let (image, background) = tokio::task::spawn_blocking(move || {
            let image = decode_art(&bytes)?;
            let background = with_background.then(|| background_color(&image));
            Ok::<_, DeviceError>((image, background))
        })
        .await??;

        Ok(LoadedArt {
            image: Arc::new(image),
            background,
        })
    }
}
