//! Local OCR using the `tesseract` CLI.
//!
//! We ask for TSV output, which gives us per-word confidences (0 to 100, or -1
//! for rows which aren't words) and bounding boxes.

use std::{collections::HashMap, process::Stdio, sync::Arc};

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    ocr::{BoundingBox, OcrImage, OcrOptions, OcrRecognition, ProviderFailure, WordBox},
    prelude::*,
};

use super::{OcrProvider, ProviderDescriptor};

/// OCR provider wrapping the `tesseract` CLI tool.
pub struct TesseractProvider {
    descriptor: ProviderDescriptor,
}

impl TesseractProvider {
    /// Create a new `tesseract` provider, if `tesseract` is installed.
    #[allow(clippy::new_ret_no_self)]
    pub async fn new(descriptor: ProviderDescriptor) -> Result<Arc<dyn OcrProvider>> {
        let output = Command::new("tesseract")
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .context("cannot run tesseract (is it installed?)")?;
        check_for_command_failure("tesseract", &output)?;
        Ok(Arc::new(Self { descriptor }))
    }

    /// Run `tesseract` and parse its output.
    #[instrument(level = "debug", skip_all, fields(provider = %self.descriptor.name))]
    async fn recognize(&self, image: &OcrImage, options: &OcrOptions) -> Result<OcrRecognition> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join(format!("input.{}", image.extension()?));
        tokio::fs::write(&input_path, &image.data)
            .await
            .context("cannot write tesseract input file")?;

        // If our caller gives up on us, take tesseract down with us.
        let output = Command::new("tesseract")
            .arg(&input_path)
            .arg("stdout")
            .args(["-l", tesseract_language(&options.language)])
            .arg("tsv")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        parse_tsv(&self.descriptor.name, &tsv)
    }
}

#[async_trait]
impl OcrProvider for TesseractProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn attempt(
        &self,
        image: &OcrImage,
        options: &OcrOptions,
    ) -> Result<OcrRecognition, ProviderFailure> {
        self.recognize(image, options)
            .await
            .map_err(|err| ProviderFailure::backend(&self.descriptor.name, err))
    }
}

/// Map ISO 639-1 codes to Tesseract's language pack names. Anything we don't
/// recognize is passed through, so `"eng+fra"` still works.
fn tesseract_language(language: &str) -> &str {
    let primary = language.split(['-', '_']).next().unwrap_or(language);
    match primary.to_ascii_lowercase().as_str() {
        "ar" => "ara",
        "de" => "deu",
        "en" => "eng",
        "es" => "spa",
        "fr" => "fra",
        "hi" => "hin",
        "it" => "ita",
        "ja" => "jpn",
        "nl" => "nld",
        "pt" => "por",
        "ru" => "rus",
        "zh" => "chi_sim",
        _ => language,
    }
}

/// Parse `tesseract ... tsv` output into a recognition.
fn parse_tsv(provider: &str, tsv: &str) -> Result<OcrRecognition> {
    let mut lines = tsv.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("tesseract produced no output"))?;
    let columns = header
        .split('\t')
        .enumerate()
        .map(|(idx, name)| (name, idx))
        .collect::<HashMap<_, _>>();
    let column = |name: &str| {
        columns
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("tesseract TSV output is missing column {:?}", name))
    };
    let (level, block, par, line, conf, text) = (
        column("level")?,
        column("block_num")?,
        column("par_num")?,
        column("line_num")?,
        column("conf")?,
        column("text")?,
    );
    let (left, top, width, height) = (
        column("left")?,
        column("top")?,
        column("width")?,
        column("height")?,
    );

    let mut page_size = None;
    let mut words = vec![];
    let mut full_text = String::new();
    let mut current_line = None;
    let mut current_par = None;
    for row in lines {
        let fields = row.split('\t').collect::<Vec<_>>();
        let field = |idx: usize| fields.get(idx).copied().unwrap_or_default();
        let number = |idx: usize| field(idx).trim().parse::<f32>().unwrap_or(0.0);

        match field(level) {
            "1" => page_size = Some((number(width), number(height))),
            "5" => {
                let word_conf = number(conf);
                let word_text = field(text).trim();
                if word_conf < 0.0 || word_text.is_empty() {
                    continue;
                }

                let par_key = (field(block), field(par));
                let line_key = (field(block), field(par), field(line));
                if current_line.is_some() && current_line != Some(line_key) {
                    full_text.push('\n');
                    if current_par != Some(par_key) {
                        full_text.push('\n');
                    }
                } else if current_line.is_some() {
                    full_text.push(' ');
                }
                current_line = Some(line_key);
                current_par = Some(par_key);
                full_text.push_str(word_text);

                let bbox = page_size.and_then(|(page_w, page_h)| {
                    (page_w > 0.0 && page_h > 0.0).then(|| BoundingBox {
                        left: number(left) / page_w,
                        top: number(top) / page_h,
                        width: number(width) / page_w,
                        height: number(height) / page_h,
                    })
                });
                words.push(WordBox {
                    text: word_text.to_owned(),
                    confidence: word_conf / 100.0,
                    bbox,
                });
            }
            _ => {}
        }
    }

    let confidence = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
    };
    trace!(%full_text, confidence, "Parsed tesseract output");
    Ok(OcrRecognition::new(provider, full_text, confidence)
        .with_words(words)
        .with_metadata(json!({ "engine": "tesseract" })))
}
