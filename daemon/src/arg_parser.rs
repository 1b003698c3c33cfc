use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    process::exit,
};

use argparse::{ArgumentParser, Print, Store, StoreOption};

const DEFAULT_CONFIG_PATH: &str = "gpuresd/config.json";

// Command line options, these win over the configuration file
#[derive(Debug, Clone, PartialEq)]
pub struct ArgsOptions {
    pub config_file_path: PathBuf,

    // Overrides the configured request file, "-" means stdout
    pub report_path: Option<PathBuf>,
}

impl ArgsOptions {
    // Parse the process arguments, exits on --help, --version
    // and on invalid arguments
    pub fn parse() -> Self {
        let args = env::args().collect();

        match Self::parse_from(args, &mut io::stdout(), &mut io::stderr()) {
            Ok(options) => options,
            Err(code) => exit(code),
        }
    }

    // Parse the given arguments, the first one being the program name.
    // Returns the exit code the process should terminate with when
    // parsing does not produce options
    pub fn parse_from(
        args: Vec<String>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<Self, i32> {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("GPU resource descriptor daemon");

            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                Store,
                "Path of the Json configuration file",
            );

            parser.refer(&mut options.report_path).add_option(
                &["-o", "--report"],
                StoreOption,
                "File the GPU requests are appended to, \"-\" for stdout",
            );

            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the daemon version",
            );

            parser.parse(args, stdout, stderr)?;
        }

        Ok(options)
    }

    // Request file to use given the configured one, None means stdout
    pub fn report_path(&self, configured: Option<PathBuf>) -> Option<PathBuf> {
        match &self.report_path {
            Some(path) if path.as_os_str() == "-" => None,
            Some(path) => Some(path.clone()),
            None => configured,
        }
    }
}

impl Default for ArgsOptions {
    fn default() -> Self {
        Self {
            config_file_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            report_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ArgsOptions, i32> {
        let args = std::iter::once("gpuresd")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect();

        ArgsOptions::parse_from(args, &mut io::sink(), &mut io::sink())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(parse(&[]), Ok(ArgsOptions::default()));
    }

    #[test]
    fn test_config_and_report_paths() {
        let options = parse(&["-c", "/etc/gpuresd.json", "--report", "/run/requests"]).unwrap();

        assert_eq!(options.config_file_path, PathBuf::from("/etc/gpuresd.json"));
        assert_eq!(options.report_path, Some(PathBuf::from("/run/requests")));
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        assert_eq!(parse(&["--fan-curve"]), Err(2));
    }

    #[test]
    fn test_report_path_override() {
        let configured = Some(PathBuf::from("/var/log/requests"));

        let options = ArgsOptions::default();
        assert_eq!(options.report_path(configured.clone()), configured);

        let options = parse(&["-o", "-"]).unwrap();
        assert_eq!(options.report_path(configured.clone()), None);

        let options = parse(&["-o", "/tmp/requests"]).unwrap();
        assert_eq!(
            options.report_path(configured),
            Some(PathBuf::from("/tmp/requests"))
        );
    }
}
