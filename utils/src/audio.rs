use base64::Engine;
use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree};

/// Sample rate the agent backend expects for PCM16 audio.
pub const AGENT_PCM16_SAMPLE_RATE: f64 = 24000.0;

pub fn create_resampler(in_sampling_rate: f64, out_sampling_rate: f64, chunk_size: usize) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1
    )?;
    Ok(resampler)
}

pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples.chunks(chunk_size).map(|chunk| {
        let mut chunk = chunk.to_vec();
        chunk.resize(chunk_size, 0.0);
        chunk
    }).collect()
}

pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size)
}

pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples.iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter()
        .map(|&sample| (sample as f32 / i16::MAX as f32).clamp(-1.0, 1.0))
        .collect()
}

/// Decodes base64 little-endian PCM16. A trailing odd byte is ignored.
pub fn decode_i16(fragment: &str) -> anyhow::Result<Vec<i16>> {
    let pcm16 = base64::engine::general_purpose::STANDARD.decode(fragment)?;
    Ok(pcm16.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|sample| sample.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Root-mean-square level of a PCM16 block, scaled to 0.0..=1.0.
pub fn rms_level(pcm16: &[i16]) -> f32 {
    if pcm16.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm16.iter()
        .map(|&sample| {
            let v = sample as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    ((sum / pcm16.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}
