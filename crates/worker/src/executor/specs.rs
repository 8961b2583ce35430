//! 各角色容器的启动参数

use uuid::Uuid;
use zimfarm_domain::{Task, UploadTarget};
use zimfarm_infrastructure::{ContainerSpec, Mount};

use super::ExecutorSettings;
use crate::roles::ContainerRole;

/// 任务目录在抓取/上传容器内的挂载点
pub const OUTPUT_DIR: &str = "/output";

/// scraper 的完整日志写在任务目录下的这个文件里
pub fn log_file_name(task: &Task) -> String {
    format!("{}_{}.log", task.id, task.offliner())
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn uploader_args(file: &str, target: &UploadTarget) -> Vec<String> {
    let mut args = vec![
        "uploader".to_string(),
        "--file".to_string(),
        format!("{OUTPUT_DIR}/{file}"),
        "--upload-uri".to_string(),
        target.uri.clone(),
    ];
    if let Some(days) = target.expiration_days {
        args.push("--delete-after".to_string());
        args.push(days.to_string());
    }
    args
}

pub struct SpecFactory<'a> {
    pub task: &'a Task,
    pub task_dir: &'a str,
    pub settings: &'a ExecutorSettings,
}

impl SpecFactory<'_> {
    fn task_id(&self) -> Uuid {
        self.task.id
    }

    fn base(&self, role: &ContainerRole, image: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(role.container_name(self.task_id()), image);
        spec.labels = role.labels(self.task_id());
        spec
    }

    pub fn artifacts_archive_name(&self) -> String {
        format!("{}_artifacts.tar.gz", self.task.id)
    }

    pub fn dnscache(&self) -> ContainerSpec {
        self.base(&ContainerRole::Dnscache, &self.settings.dnscache_image)
    }

    pub fn scraper(&self, dns: Option<&str>) -> ContainerSpec {
        let role = ContainerRole::Scraper;
        let config = &self.task.config;
        let mut spec = ContainerSpec::new(
            role.container_name(self.task_id()),
            config.image.to_string(),
        )
        .with_command(config.command.clone())
        .with_mount(Mount::bind(self.task_dir, OUTPUT_DIR))
        .with_env("TASK_ID", self.task.id.to_string());
        spec.labels = role.reservation_labels(self.task_id(), config);
        spec.dns = dns.map(|ip| vec![ip.to_string()]).unwrap_or_default();
        spec.working_dir = Some(OUTPUT_DIR.to_string());
        spec.cpu_shares = Some(config.resources.cpu.saturating_mul(1024));
        spec.memory_limit = Some(config.resources.memory);
        spec
    }

    pub fn monitor(&self, image: &str, scraper_address: &str) -> ContainerSpec {
        self.base(&ContainerRole::Monitor, image)
            .with_env("SCRAPER_CONTAINER", ContainerRole::Scraper.container_name(self.task_id()))
            .with_env("SCRAPER_ADDRESS", scraper_address)
            .with_env("TASK_ID", self.task.id.to_string())
    }

    pub fn zim_uploader(&self, file: &str, target: &UploadTarget) -> ContainerSpec {
        self.base(
            &ContainerRole::ZimUploader(file.to_string()),
            &self.settings.uploader_image,
        )
        .with_command(uploader_args(file, target))
        .with_mount(Mount::bind(self.task_dir, OUTPUT_DIR).read_only())
    }

    pub fn checker(&self, file: &str) -> ContainerSpec {
        let path = format!("{OUTPUT_DIR}/{file}");
        let script = format!(
            "zimcheck --all --json {} > {}",
            shell_quote(&path),
            shell_quote(&format!("{path}.check.json"))
        );
        self.base(
            &ContainerRole::Checker(file.to_string()),
            &self.settings.checker_image,
        )
        .with_command(vec!["sh".to_string(), "-c".to_string(), script])
        .with_mount(Mount::bind(self.task_dir, OUTPUT_DIR))
    }

    pub fn check_uploader(&self, file: &str, target: &UploadTarget) -> ContainerSpec {
        self.base(
            &ContainerRole::CheckUploader(file.to_string()),
            &self.settings.uploader_image,
        )
        .with_command(uploader_args(&format!("{file}.check.json"), target))
        .with_mount(Mount::bind(self.task_dir, OUTPUT_DIR).read_only())
    }

    pub fn log_uploader(&self, target: &UploadTarget) -> ContainerSpec {
        self.base(&ContainerRole::LogUploader, &self.settings.uploader_image)
            .with_command(uploader_args(&log_file_name(self.task), target))
            .with_mount(Mount::bind(self.task_dir, OUTPUT_DIR).read_only())
    }

    /// 只打包匹配 `artifacts_globs` 的文件；glob 交给容器内的shell展开
    pub fn artifacts_uploader(&self, target: &UploadTarget) -> ContainerSpec {
        let archive = self.artifacts_archive_name();
        let upload = uploader_args(&archive, target)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let script = format!(
            "cd {OUTPUT_DIR} && tar -czf {} {} && {}",
            shell_quote(&archive),
            self.task.config.artifacts_globs.join(" "),
            upload
        );
        self.base(&ContainerRole::ArtifactsUploader, &self.settings.uploader_image)
            .with_command(vec!["sh".to_string(), "-c".to_string(), script])
            .with_mount(Mount::bind(self.task_dir, OUTPUT_DIR))
    }
}
