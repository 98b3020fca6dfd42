use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::ssh::local_hostname;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

const DEFAULT_COMMAND_ID: i64 = -999;

/// Everything needed to launch one job, plus the output it produced.
///
/// Input files map a logical name to a path relative to the working
/// directory. The executable may reference them as `${name}` when
/// `append_input` is off, and may reference `${installDir}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfiguration {
    command_id: i64,
    executable: String,
    interpreter: Option<String>,
    arguments: Vec<String>,
    input_files: BTreeMap<String, String>,
    append_input: bool,
    num_procs: u32,
    install_directory: Option<String>,
    #[serde(deserialize_with = "directory")]
    working_directory: String,
    remote_working_directory: String,
    os: String,
    out_file_name: String,
    err_file_name: String,

    #[serde(skip)]
    launch_in_place: bool,
    #[serde(skip)]
    hostname: String,
    #[serde(skip)]
    full_command: String,
    #[serde(skip)]
    split_command: Vec<String>,
    #[serde(skip)]
    std_output: String,
    #[serde(skip)]
    err_output: String,
}

impl Default for CommandConfiguration {
    fn default() -> Self {
        Self {
            command_id: DEFAULT_COMMAND_ID,
            executable: String::new(),
            interpreter: None,
            arguments: Vec::new(),
            input_files: BTreeMap::new(),
            append_input: true,
            num_procs: 1,
            install_directory: None,
            working_directory: String::new(),
            remote_working_directory: String::new(),
            os: std::env::consts::OS.to_string(),
            out_file_name: String::new(),
            err_file_name: String::new(),
            launch_in_place: false,
            hostname: String::new(),
            full_command: String::new(),
            split_command: Vec::new(),
            std_output: String::new(),
            err_output: String::new(),
        }
    }
}

fn with_separator(directory: &str) -> String {
    if directory.is_empty() {
        return String::new();
    }
    let separator = if directory.contains('\\') { '\\' } else { '/' };
    if directory.ends_with(separator) {
        directory.to_string()
    } else {
        format!("{}{}", directory, separator)
    }
}

fn directory<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(with_separator(&raw))
}

/// Output and error files of a running job, opened for append
pub(crate) struct OutputFiles {
    pub out: File,
    pub err: File,
}

impl CommandConfiguration {
    pub fn new(command_id: i64, executable: impl Into<String>) -> Self {
        Self {
            command_id,
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn command_id(&self) -> i64 {
        self.command_id
    }

    pub fn set_command_id(&mut self, command_id: i64) {
        self.command_id = command_id;
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn set_executable(&mut self, executable: impl Into<String>) {
        self.executable = executable.into();
    }

    pub fn set_interpreter(&mut self, interpreter: impl Into<String>) {
        self.interpreter = Some(interpreter.into());
    }

    pub fn add_argument(&mut self, argument: impl Into<String>) {
        self.arguments.push(argument.into());
    }

    pub fn add_input_file(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.input_files.insert(name.into(), path.into());
    }

    pub fn input_files(&self) -> &BTreeMap<String, String> {
        &self.input_files
    }

    /// Input paths, space separated
    pub fn input_file_list(&self) -> String {
        self.input_files
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn append_input(&self) -> bool {
        self.append_input
    }

    pub fn set_append_input(&mut self, append_input: bool) {
        self.append_input = append_input;
    }

    pub fn set_num_procs(&mut self, num_procs: u32) {
        self.num_procs = num_procs;
    }

    pub fn install_directory(&self) -> Option<&str> {
        self.install_directory.as_deref()
    }

    pub fn set_install_directory(&mut self, directory: impl Into<String>) {
        self.install_directory = Some(directory.into());
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    /// Always stored with a trailing separator.
    pub fn set_working_directory(&mut self, directory: &str) {
        self.working_directory = with_separator(directory);
    }

    pub fn remote_working_directory(&self) -> &str {
        &self.remote_working_directory
    }

    pub fn set_remote_working_directory(&mut self, directory: impl Into<String>) {
        self.remote_working_directory = directory.into();
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn set_os(&mut self, os: impl Into<String>) {
        self.os = os.into();
    }

    pub fn is_windows(&self) -> bool {
        self.os.trim().to_ascii_lowercase().starts_with("win")
    }

    pub fn out_file_name(&self) -> &str {
        &self.out_file_name
    }

    pub fn set_out_file_name(&mut self, name: impl Into<String>) {
        self.out_file_name = name.into();
    }

    pub fn err_file_name(&self) -> &str {
        &self.err_file_name
    }

    pub fn set_err_file_name(&mut self, name: impl Into<String>) {
        self.err_file_name = name.into();
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }

    /// The executable is a file in the working directory. A bare name is
    /// then launched as `./name` because the shell does not search there.
    pub(crate) fn set_launch_in_place(&mut self, in_place: bool) {
        self.launch_in_place = in_place;
    }

    fn launch_target(&self) -> String {
        let bare = !self.executable.is_empty()
            && !self
                .executable
                .contains(|c: char| c == '/' || c == '\\' || c == '$' || c == ';' || c.is_whitespace());
        if self.launch_in_place && bare {
            format!("./{}", self.executable)
        } else {
            self.executable.clone()
        }
    }

    pub fn full_command(&self) -> &str {
        &self.full_command
    }

    pub fn split_command(&self) -> &[String] {
        &self.split_command
    }

    /// Captured standard output, comment lines removed
    pub fn std_output(&self) -> &str {
        &self.std_output
    }

    /// Captured standard error, comment lines removed
    pub fn err_output(&self) -> &str {
        &self.err_output
    }

    /// Reject configurations a job cannot even be attempted with.
    pub fn validate(&self) -> AppResult<()> {
        if self.executable.trim().is_empty() {
            return Err(AppError::InvalidConfig("No executable given".to_string()));
        }
        if self.out_file_name.is_empty() || self.err_file_name.is_empty() {
            return Err(AppError::InvalidConfig(
                "Output and error file names are required".to_string(),
            ));
        }
        if self.working_directory.is_empty() {
            return Err(AppError::InvalidConfig("No working directory given".to_string()));
        }
        if self.num_procs == 0 {
            return Err(AppError::InvalidConfig("num_procs must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Assemble the command line and split it into `;`-separated stages.
    pub fn executable_name(&mut self) -> String {
        let mut line = String::new();
        if let Some(interpreter) = self.interpreter.as_deref().filter(|i| !i.is_empty()) {
            line.push_str(interpreter);
            line.push(' ');
        }
        line.push_str(&self.launch_target());
        for argument in &self.arguments {
            line.push(' ');
            line.push_str(argument);
        }
        if self.append_input && !self.input_files.is_empty() {
            line.push(' ');
            line.push_str(&self.input_file_list());
        }

        if !self.append_input {
            for (name, path) in &self.input_files {
                line = line.replace(&format!("${{{}}}", name), path);
            }
        }
        if let Some(install) = self.install_directory.as_deref() {
            let separator = if install.contains(":\\") { '\\' } else { '/' };
            let install = if install.ends_with(separator) {
                install.to_string()
            } else {
                format!("{}{}", install, separator)
            };
            line = line.replace("${installDir}", &install);
        }
        if self.num_procs > 1 {
            line = format!("mpirun -np {} {}", self.num_procs, line);
        }

        let line = line.trim().to_string();
        self.split_command = if line.contains(';') {
            line.split(';')
                .map(str::trim)
                .filter(|stage| !stage.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            vec![format!("{};", line)]
        };
        for (i, stage) in self.split_command.iter().enumerate() {
            tracing::info!("Command {} launch stage {} = {}", self.command_id, i, sanitize(stage));
        }
        self.full_command = line.clone();
        line
    }

    /// Header written at the top of each output file. Every line starts
    /// with `#` so it never reaches the captured output.
    pub fn output_header(&self, log_name: &str) -> String {
        format!(
            "# Logfile type : {}\n\
             # Job launch date: {}\n\
             # Launch host: {}\n\
             # Target host: {}\n\
             # Command Executed: {}\n\
             # Input files: {}\n\
             # Install directory: {}\n\n",
            log_name,
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            local_hostname(),
            self.hostname,
            self.full_command,
            self.input_file_list(),
            self.install_directory.as_deref().unwrap_or(""),
        )
    }

    /// Write the headers into the output and error files.
    pub fn create_output_files(&self) -> AppResult<()> {
        let mut files = self.open_output_files()?;
        files.out.write_all(self.output_header("standard output").as_bytes())?;
        files.err.write_all(self.output_header("standard error").as_bytes())?;
        Ok(())
    }

    pub(crate) fn open_output_files(&self) -> AppResult<OutputFiles> {
        Ok(OutputFiles {
            out: open_append(&self.out_file_name)?,
            err: open_append(&self.err_file_name)?,
        })
    }

    /// Read the output files back, skipping `#` lines.
    pub fn collect_output(&mut self) -> AppResult<()> {
        self.std_output = read_uncommented(&self.out_file_name)?;
        self.err_output = read_uncommented(&self.err_file_name)?;
        Ok(())
    }
}

fn open_append(name: &str) -> AppResult<File> {
    if let Some(parent) = Path::new(name).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(name)
        .map_err(|e| AppError::Execution(format!("Cannot open {}: {}", name, e)))
}

fn read_uncommented(name: &str) -> AppResult<String> {
    let file = File::open(name)?;
    let mut text = String::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        text.push_str(&line);
        text.push('\n');
    }
    Ok(text.trim_start_matches('\n').to_string())
}
