//! Per-request file layout shared by the gateway and the render host, and the
//! render configuration handed to the render executable.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PathsConfig;

pub const VIDEO_DIR_NAME: &str = "video";
pub const RENDER_CONFIG_FILE_NAME: &str = "mvc_cfg.yaml";
pub const CHARACTER_CONFIG_FILE_NAME: &str = "char_cfg.yaml";
const RETARGET_CONFIG: &str = "retarget/fair1_ppf.yaml";
const MOTION_CONFIG_DIR: &str = "motion";
const ARTIFACT_EXTENSION: &str = "gif";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    #[error("Invalid animation: {0}")]
    UnknownAnimation(String),
    #[error("Invalid ad_id: {0:?}")]
    InvalidAdId(String),
}

/// Animations the renderer ships motion configs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Animation {
    Dab,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: [f64; 3],
    pub forward: [f64; 3],
}

impl Animation {
    pub const ALL: [Animation; 2] = [Animation::Dab, Animation::Zombie];

    pub fn as_str(self) -> &'static str {
        match self {
            Animation::Dab => "dab",
            Animation::Zombie => "zombie",
        }
    }

    pub fn camera(self) -> Camera {
        match self {
            Animation::Dab => Camera {
                position: [0.0, 0.9, 2.0],
                forward: [0.0, 0.5, 2.0],
            },
            Animation::Zombie => Camera {
                position: [1.0, 0.7, 4.0],
                forward: [0.0, 0.5, 4.0],
            },
        }
    }
}

impl FromStr for Animation {
    type Err = WorkspaceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|animation| animation.as_str() == raw)
            .ok_or_else(|| WorkspaceError::UnknownAnimation(raw.to_string()))
    }
}

impl fmt::Display for Animation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct SceneConfig {
    animated_characters: Vec<CharacterConfig>,
}

#[derive(Serialize)]
struct CharacterConfig {
    character_cfg: String,
    motion_cfg: String,
    retarget_cfg: String,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct ViewConfig {
    use_mesa: bool,
    camera_pos: [f64; 3],
    camera_fwd: [f64; 3],
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct ControllerConfig {
    mode: &'static str,
    output_video_path: String,
}

#[derive(Serialize)]
struct RenderConfig {
    scene: SceneConfig,
    view: ViewConfig,
    controller: ControllerConfig,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    paths: PathsConfig,
}

/// Where one `(ad_id, animation)` request lives, from both hosts' views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    pub ad_id: String,
    pub animation: Animation,
    base_path: PathBuf,
    render_base_path: PathBuf,
}

impl Workspace {
    pub fn new(paths: PathsConfig) -> Self {
        Self { paths }
    }

    pub fn files_dir(&self) -> &Path {
        &self.paths.files_dir
    }

    pub fn layout(&self, ad_id: &str, animation: Animation) -> Result<JobLayout, WorkspaceError> {
        validate_ad_id(ad_id)?;
        Ok(JobLayout {
            ad_id: ad_id.to_string(),
            animation,
            base_path: self.paths.files_dir.join(ad_id),
            render_base_path: self.paths.render_workspace_dir.join(ad_id),
        })
    }

    /// Writes the render configuration for `layout` and returns its path as
    /// the render host sees it.
    pub fn prepare_render_config(&self, layout: &JobLayout) -> Result<String> {
        if !layout.base_path.is_dir() {
            bail!(
                "no uploaded drawing found for ad_id {} (missing {})",
                layout.ad_id,
                layout.base_path.display()
            );
        }

        let video_dir = layout.base_path.join(VIDEO_DIR_NAME);
        fs::create_dir_all(&video_dir)
            .with_context(|| format!("failed to create video directory: {}", video_dir.display()))?;

        let camera = layout.animation.camera();
        let motion_cfg = self
            .paths
            .render_config_dir
            .join(MOTION_CONFIG_DIR)
            .join(format!("{}.yaml", layout.animation));
        let retarget_cfg = self.paths.render_config_dir.join(RETARGET_CONFIG);

        let config = RenderConfig {
            scene: SceneConfig {
                animated_characters: vec![CharacterConfig {
                    character_cfg: path_string(
                        &layout.render_base_path.join(CHARACTER_CONFIG_FILE_NAME),
                    ),
                    motion_cfg: path_string(&motion_cfg),
                    retarget_cfg: path_string(&retarget_cfg),
                }],
            },
            view: ViewConfig {
                use_mesa: true,
                camera_pos: camera.position,
                camera_fwd: camera.forward,
            },
            controller: ControllerConfig {
                mode: "video_render",
                output_video_path: path_string(&layout.render_artifact_path()),
            },
        };

        // JSON is a YAML subset, so the renderer's YAML loader reads it as-is.
        let encoded =
            serde_json::to_string_pretty(&config).context("failed to serialize render config")?;
        let config_path = layout.render_config_path();
        fs::write(&config_path, encoded)
            .with_context(|| format!("failed to write render config: {}", config_path.display()))?;

        Ok(path_string(&layout.render_host_config_path()))
    }
}

impl JobLayout {
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `video/<animation>.gif`, relative to the request's base path.
    pub fn relative_artifact_path(&self) -> PathBuf {
        Path::new(VIDEO_DIR_NAME).join(format!("{}.{ARTIFACT_EXTENSION}", self.animation))
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.base_path.join(self.relative_artifact_path())
    }

    pub fn artifact_exists(&self) -> bool {
        self.artifact_path().is_file()
    }

    pub fn render_config_path(&self) -> PathBuf {
        self.base_path.join(RENDER_CONFIG_FILE_NAME)
    }

    fn render_artifact_path(&self) -> PathBuf {
        self.render_base_path.join(self.relative_artifact_path())
    }

    fn render_host_config_path(&self) -> PathBuf {
        self.render_base_path.join(RENDER_CONFIG_FILE_NAME)
    }
}

fn validate_ad_id(ad_id: &str) -> Result<(), WorkspaceError> {
    let trimmed = ad_id.trim();
    if trimmed.is_empty()
        || trimmed != ad_id
        || ad_id == "."
        || ad_id.contains("..")
        || ad_id.contains(['/', '\\'])
    {
        return Err(WorkspaceError::InvalidAdId(ad_id.to_string()));
    }
    Ok(())
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
