//! Document conversions through external tools.
//!
//! docx <-> pdf goes through headless LibreOffice; pdf -> png is poppler's
//! `pdfinfo` for the page count plus one `pdftoppm` run per page in the
//! bounded page pool. Each job works inside its own temporary directory,
//! which is removed however the job ends.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use super::pages::{self, DEFAULT_PAGE_CONCURRENCY};
use super::{ensure_supported, ConvertError, ConvertedFile, Converter};
use crate::capability::{CapabilityClass, Format};
use crate::job::ConvertRequest;

/// Paths and limits for the external document tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentToolsConfig {
    pub soffice_path: PathBuf,
    pub pdftoppm_path: PathBuf,
    pub pdfinfo_path: PathBuf,
    pub tool_timeout_secs: u64,
    pub render_dpi: u32,
    pub page_concurrency: usize,
    /// Parent of the per-job workspaces; the system temp dir when unset.
    pub work_root: Option<PathBuf>,
}

impl Default for DocumentToolsConfig {
    fn default() -> Self {
        Self {
            soffice_path: PathBuf::from("soffice"),
            pdftoppm_path: PathBuf::from("pdftoppm"),
            pdfinfo_path: PathBuf::from("pdfinfo"),
            tool_timeout_secs: 120,
            render_dpi: 200,
            page_concurrency: DEFAULT_PAGE_CONCURRENCY,
            work_root: None,
        }
    }
}

/// Arguments for a headless LibreOffice conversion.
///
/// The profile directory is per job so concurrent instances do not fight
/// over a shared user installation.
pub fn soffice_args(
    input: &Path,
    outdir: &Path,
    target_ext: &str,
    infilter: Option<&str>,
    profile_dir: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        format!("-env:UserInstallation=file://{}", profile_dir.display()).into(),
        "--headless".into(),
        "--norestore".into(),
    ];
    if let Some(filter) = infilter {
        args.push(format!("--infilter={}", filter).into());
    }
    args.extend([
        "--convert-to".into(),
        target_ext.into(),
        "--outdir".into(),
        outdir.as_os_str().to_owned(),
        input.as_os_str().to_owned(),
    ]);
    args
}

/// Arguments rendering a single page to `{prefix}.png`.
pub fn pdftoppm_args(page: usize, dpi: u32, input: &Path, prefix: &Path) -> Vec<OsString> {
    vec![
        "-f".into(),
        page.to_string().into(),
        "-l".into(),
        page.to_string().into(),
        "-r".into(),
        dpi.to_string().into(),
        "-png".into(),
        "-singlefile".into(),
        input.as_os_str().to_owned(),
        prefix.as_os_str().to_owned(),
    ]
}

/// Extracts the `Pages:` line from `pdfinfo` output.
pub fn parse_page_count(pdfinfo_stdout: &str) -> Option<usize> {
    pdfinfo_stdout.lines().find_map(|line| {
        let rest = line.strip_prefix("Pages:")?;
        rest.trim().parse().ok()
    })
}

fn tool_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Converter for the document capability class.
#[derive(Debug, Clone)]
pub struct DocumentConverter {
    config: DocumentToolsConfig,
}

impl DocumentConverter {
    pub fn new(config: DocumentToolsConfig) -> Self {
        Self { config }
    }

    async fn run_tool(&self, program: &Path, args: &[OsString]) -> Result<Output, ConvertError> {
        let tool = tool_name(program);
        debug!(tool = %tool, ?args, "Running conversion tool");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ConvertError::ToolNotFound {
                        path: program.to_path_buf(),
                    }
                } else {
                    ConvertError::Io(e)
                }
            })?;

        let timeout = Duration::from_secs(self.config.tool_timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ConvertError::Timeout {
                tool: tool.clone(),
                timeout_secs: self.config.tool_timeout_secs,
            })??;

        if !output.status.success() {
            return Err(ConvertError::ToolFailed {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Runs LibreOffice and returns the path of the produced file.
    async fn soffice_convert(
        &self,
        workdir: &Path,
        input: &Path,
        target_ext: &str,
        infilter: Option<&str>,
    ) -> Result<PathBuf, ConvertError> {
        let outdir = workdir.join("out");
        tokio::fs::create_dir_all(&outdir).await?;
        let args = soffice_args(input, &outdir, target_ext, infilter, &workdir.join("profile"));
        self.run_tool(&self.config.soffice_path, &args).await?;

        // soffice keeps every dot of the input name except the last
        let stem = input.file_stem().unwrap_or_default().to_string_lossy();
        let produced = outdir.join(format!("{}.{}", stem, target_ext));
        if !tokio::fs::try_exists(&produced).await? {
            return Err(ConvertError::ToolFailed {
                tool: tool_name(&self.config.soffice_path),
                code: Some(0),
                stderr: format!("expected output {} was not produced", produced.display()),
            });
        }
        Ok(produced)
    }

    async fn page_count(&self, pdf: &Path) -> Result<usize, ConvertError> {
        let output = self
            .run_tool(&self.config.pdfinfo_path, &[pdf.as_os_str().to_owned()])
            .await?;
        parse_page_count(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ConvertError::Decode("pdfinfo did not report a page count".to_string())
        })
    }

    async fn render_page(&self, pdf: &Path, pages_dir: &Path, index: usize) -> Result<Bytes, ConvertError> {
        let prefix = pages_dir.join(format!("page-{}", index));
        let args = pdftoppm_args(index, self.config.render_dpi, pdf, &prefix);
        self.run_tool(&self.config.pdftoppm_path, &args).await?;
        let bytes = tokio::fs::read(prefix.with_extension("png")).await?;
        Ok(Bytes::from(bytes))
    }

    /// Rasterizes every page of `pdf`, bundling them in page order.
    async fn rasterize(&self, workdir: &Path, pdf: &Path, stem: &str) -> Result<ConvertedFile, ConvertError> {
        let page_count = self.page_count(pdf).await?;
        if page_count == 0 {
            return Err(ConvertError::NoPages);
        }

        let pages_dir = workdir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;
        let pages_dir = pages_dir.as_path();

        let rendered = pages::render_pages(page_count, self.config.page_concurrency, |index| {
            self.render_page(pdf, pages_dir, index)
        })
        .await?;

        info!(pages = rendered.len(), stem = stem, "Rendered document pages");
        pages::bundle_pages(stem, rendered)
    }

    async fn convert_in(&self, workdir: &TempDir, request: &ConvertRequest) -> Result<ConvertedFile, ConvertError> {
        let dir = workdir.path();
        let input = dir.join(&request.filename);
        tokio::fs::write(&input, &request.payload).await?;

        let stem = request.stem();
        let read_as = |path: PathBuf, format: Format| async move {
            let bytes = tokio::fs::read(&path).await?;
            Ok::<_, ConvertError>(ConvertedFile::new(
                bytes,
                format!("{}.{}", stem, format),
                format.mime_type(),
            ))
        };

        match (request.source, request.target) {
            (Format::Docx, Format::Pdf) => {
                let pdf = self.soffice_convert(dir, &input, "pdf", None).await?;
                read_as(pdf, Format::Pdf).await
            }
            (Format::Pdf, Format::Docx) => {
                let docx = self
                    .soffice_convert(dir, &input, "docx", Some("writer_pdf_import"))
                    .await?;
                read_as(docx, Format::Docx).await
            }
            (Format::Pdf, Format::Png) => self.rasterize(dir, &input, stem).await,
            (Format::Docx, Format::Png) => {
                let pdf = self.soffice_convert(dir, &input, "pdf", None).await?;
                self.rasterize(dir, &pdf, stem).await
            }
            (from, to) => Err(ConvertError::Unsupported { from, to }),
        }
    }
}

#[async_trait]
impl Converter for DocumentConverter {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Document
    }

    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertedFile, ConvertError> {
        ensure_supported(self.class(), request)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("convert-");
        let workdir = match &self.config.work_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let result = self.convert_in(&workdir, request).await;
        if let Err(e) = workdir.close() {
            tracing::warn!(error = %e, "Failed to remove conversion workspace");
        }

        let file = result?;
        info!(
            filename = %request.filename,
            source = %request.source,
            target = %request.target,
            output = %file.filename,
            bytes = file.bytes.len(),
            "Document converted"
        );
        Ok(file)
    }
}
