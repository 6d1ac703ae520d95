//! Text recognition through the `tesseract` command-line tool.

use std::{
    io::{Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{RecvTimeoutError, bounded};
use image::{ExtendedColorType, GrayImage, ImageEncoder, codecs::png::PngEncoder};
use tracing::{debug, warn};

use crate::recognizer::{TextCandidate, TextRecognizer};

/// Runs `tesseract stdin stdout ... tsv` per image and groups words into lines.
#[derive(Clone, Debug)]
pub struct TesseractCli {
    binary: PathBuf,
    languages: Vec<String>,
    page_seg_mode: u8,
    timeout: Duration,
}

impl TesseractCli {
    pub fn new<S: AsRef<str>>(languages: &[S]) -> Self {
        let languages: Vec<String> = languages
            .iter()
            .map(|lang| lang.as_ref().trim().to_string())
            .filter(|lang| !lang.is_empty())
            .collect();
        Self {
            binary: PathBuf::from("tesseract"),
            languages: if languages.is_empty() {
                vec!["eng".to_string()]
            } else {
                languages
            },
            page_seg_mode: 11,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Tesseract `--psm` value; 7 treats the image as a single text line.
    pub fn with_page_seg_mode(mut self, psm: u8) -> Self {
        self.page_seg_mode = psm;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, png: Vec<u8>) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(self.languages.join("+"))
            .arg("--psm")
            .arg(self.page_seg_mode.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open tesseract stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture tesseract stdout"))?;

        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let mut output = String::new();
            let result = stdout.read_to_string(&mut output).map(|_| output);
            let _ = tx.send(result);
        });
        thread::spawn(move || {
            if let Err(err) = stdin.write_all(&png) {
                debug!("tesseract stdin closed early: {err}");
            }
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(output)) => {
                let status = child.wait().context("failed to wait for tesseract")?;
                if !status.success() {
                    bail!("tesseract exited with {status}");
                }
                Ok(output)
            }
            Ok(Err(err)) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(err).context("failed to read tesseract output")
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                warn!("tesseract did not finish within {:?}; killing it", self.timeout);
                let _ = child.kill();
                let _ = child.wait();
                bail!("tesseract timed out after {:?}", self.timeout)
            }
        }
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<TextCandidate>> {
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::L8,
            )
            .map_err(|err| anyhow!("PNG encode failed: {err}"))?;
        let tsv = self.run(png)?;
        Ok(parse_tsv(&tsv))
    }
}

/// Group TSV word rows (level 5) into lines with their mean confidence.
pub(crate) fn parse_tsv(tsv: &str) -> Vec<TextCandidate> {
    // (block, paragraph, line) -> words, confidence sum
    let mut lines: Vec<((u32, u32, u32), Vec<String>, f32)> = Vec::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        let confidence = cols[10].trim().parse::<f32>().unwrap_or(-1.0);
        if text.is_empty() || confidence < 0.0 {
            continue;
        }
        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        match lines.iter_mut().find(|(existing, _, _)| *existing == key) {
            Some((_, words, total)) => {
                words.push(text.to_string());
                *total += confidence;
            }
            None => lines.push((key, vec![text.to_string()], confidence)),
        }
    }

    lines
        .into_iter()
        .map(|(_, words, total)| {
            let mean = total / words.len() as f32;
            TextCandidate::new(words.join(" "), (mean / 100.0).clamp(0.0, 1.0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t320\t240\t-1\t\n\
4\t1\t1\t1\t1\t0\t10\t10\t100\t20\t-1\t\n\
5\t1\t1\t1\t1\t1\t10\t10\t40\t20\t90\tAB\n\
5\t1\t1\t1\t1\t2\t55\t10\t50\t20\t80\t12CD\n\
5\t1\t2\t1\t1\t1\t10\t100\t80\t20\t70.5\tXYZ123\n\
5\t1\t2\t1\t1\t2\t95\t100\t5\t20\t-1\t \n";

    #[test]
    fn groups_words_by_line_in_reading_order() {
        let candidates = parse_tsv(SAMPLE);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].text, "AB 12CD");
        assert!((candidates[0].confidence - 0.85).abs() < 1e-4);
        assert_eq!(candidates[1].text, "XYZ123");
        assert!((candidates[1].confidence - 0.705).abs() < 1e-4);
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_tsv("").is_empty());
        assert!(parse_tsv("level\tpage_num\n").is_empty());
    }

    #[test]
    fn default_language_is_english() {
        let cli = TesseractCli::new::<&str>(&[]);
        assert_eq!(cli.languages, vec!["eng".to_string()]);
        let cli = TesseractCli::new(&["eng", " deu "]);
        assert_eq!(cli.languages.join("+"), "eng+deu");
    }

    #[test]
    fn missing_binary_is_an_error() {
        let cli = TesseractCli::new(&["eng"]).with_binary("/nonexistent/tesseract-binary");
        let image = GrayImage::new(4, 4);
        assert!(cli.recognize(&image).is_err());
    }
}
