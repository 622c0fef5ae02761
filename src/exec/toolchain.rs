//! Toolchain discovery: which interpreter or compiler handles a file, and
//! the exact command line needed to build it.
use std::{
    borrow::Cow,
    ffi::OsString,
    fmt,
    path::PathBuf,
    sync::{Arc, OnceLock},
};
use regex::RegexSet;

use super::SourceFile;
use crate::error::ExecError;

/// Socket programs on Solaris-family hosts link against these.
const NEEDS_LIBSOCKET: bool = cfg!(any(target_os = "solaris", target_os = "illumos"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) { Platform::Windows } else { Platform::Unix }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    C,
    Cpp,
    Html,
}

impl Language {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "py"          => Some(Language::Python),
            "js"          => Some(Language::JavaScript),
            "c"           => Some(Language::C),
            "cpp" | "cc"  => Some(Language::Cpp),
            "html"        => Some(Language::Html),
            _             => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Language::Python     => "Python",
            Language::JavaScript => "Node.js",
            Language::C          => "C",
            Language::Cpp        => "C++",
            Language::Html       => "HTML",
        }
    }

    /// Extensions compiled together into one binary.
    fn source_exts(self) -> &'static [&'static str] {
        match self {
            Language::C   => &[".c"],
            Language::Cpp => &[".cpp", ".cc", ".cxx"],
            _             => &[],
        }
    }

    fn is_source(self, name: &str) -> bool {
        self.source_exts().iter().any(|e| name.ends_with(e))
    }
}

fn is_header(name: &str) -> bool {
    [".h", ".hpp", ".hxx"].iter().any(|e| name.ends_with(e))
}

/* ------------ 命令 ------------ */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args:    Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }
}

fn quote(s: &str) -> Cow<'_, str> {
    if s.contains(' ') { Cow::Owned(format!("\"{s}\"")) } else { Cow::Borrowed(s) }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program.to_string_lossy()))?;
        for a in &self.args {
            write!(f, " {}", quote(a))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFamily {
    Gnu,
    Clang,
    Msvc,
}

impl CompilerFamily {
    fn of(name: &str) -> Self {
        match name {
            "cl"                          => CompilerFamily::Msvc,
            n if n.starts_with("clang")   => CompilerFamily::Clang,
            _                             => CompilerFamily::Gnu,
        }
    }
}

/// What the orchestrator has to do for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipeline {
    /// Rendered by the client; nothing runs on the server.
    Preview,
    Run(Runnable),
}

/// Work that needs a job directory and a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runnable {
    Interpret {
        language:    Language,
        interpreter: PathBuf,
        entry:       String,
    },
    Compile {
        language: Language,
        compiler: &'static str,
        build:    CommandSpec,
        binary:   String,
        entry:    String,
        sources:  usize,
    },
}

/* ------------ 連結函式庫偵測 ------------ */
const MATH_PATTERNS: &[&str] =
    &[r"math\.h", r"cmath", r"\bsin\b", r"\bcos\b", r"\btan\b", r"\bsqrt\b", r"\bpow\b"];
const THREAD_PATTERNS: &[&str] = &[r"pthread\.h", r"thread", r"\bmutex\b", r"\bthread_create\b"];
const SOCKET_PATTERNS: &[&str] =
    &[r"socket\.h", r"\bsocket\b", r"\bbind\b", r"\blisten\b", r"\baccept\b"];

fn indicators() -> &'static [RegexSet; 3] {
    static SETS: OnceLock<[RegexSet; 3]> = OnceLock::new();
    SETS.get_or_init(|| {
        let set = |p: &[&str]| RegexSet::new(p).expect("indicator patterns are valid regexes");
        [set(MATH_PATTERNS), set(THREAD_PATTERNS), set(SOCKET_PATTERNS)]
    })
}

/// Auxiliary libraries a C/C++ program appears to use, guessed from its text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibraryNeeds {
    pub math:    bool,
    pub threads: bool,
    pub sockets: bool,
}

impl LibraryNeeds {
    pub fn scan<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let [math, threads, sockets] = indicators();
        texts.into_iter().fold(Self::default(), |acc, t| Self {
            math:    acc.math || math.is_match(t),
            threads: acc.threads || threads.is_match(t),
            sockets: acc.sockets || sockets.is_match(t),
        })
    }

    pub fn link_flags(&self, family: CompilerFamily, platform: Platform) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if family == CompilerFamily::Msvc {
            return flags;
        }
        if self.math    { flags.push("-lm"); }
        if self.threads { flags.push("-pthread"); }
        if self.sockets {
            match platform {
                Platform::Windows              => flags.push("-lws2_32"),
                Platform::Unix if NEEDS_LIBSOCKET => flags.extend(["-lsocket", "-lnsl"]),
                Platform::Unix                 => {}
            }
        }
        flags
    }
}

/* ------------ 描述 ------------ */
/// Probe order plus remediation text for one executable language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainDescriptor {
    pub language:   Language,
    pub candidates: Vec<&'static str>,
    pub missing:    &'static str,
    pub hint:       &'static str,
}

const CC_HINT: &str = "Please install GCC/G++ or Clang. On Windows, install MinGW from \
https://mingw-w64.org/ or MSYS2 from https://www.msys2.org/. On Linux, run \
'sudo apt-get install build-essential'.";

impl ToolchainDescriptor {
    pub fn for_language(language: Language, platform: Platform) -> Option<Self> {
        let windows = platform == Platform::Windows;
        let (candidates, missing, hint) = match language {
            Language::Python => (
                if windows { vec!["python", "py", "python3"] } else { vec!["python3", "python", "py"] },
                "Python",
                "Please install Python from https://www.python.org/downloads/ and make sure to \
                 check 'Add Python to PATH' during installation.",
            ),
            Language::JavaScript => (
                vec!["node", "nodejs"],
                "Node.js",
                "Please install Node.js from https://nodejs.org/ and make sure it is on the PATH.",
            ),
            Language::C => {
                let mut c = vec!["gcc", "clang"];
                if windows { c.push("cl"); }
                (c, "A C compiler", CC_HINT)
            }
            Language::Cpp => {
                let mut c = vec!["g++", "clang++"];
                if windows { c.push("cl"); }
                (c, "A C++ compiler", CC_HINT)
            }
            Language::Html => return None,
        };
        Some(Self { language, candidates, missing, hint })
    }
}

/* ------------ 探測 ------------ */
pub trait Probe: Send + Sync {
    fn find(&self, program: &str) -> Option<PathBuf>;
}

/// Looks programs up on an explicit PATH, the same one handed to children.
pub struct PathProbe {
    path: OsString,
    cwd:  PathBuf,
}

impl PathProbe {
    pub fn new(path: OsString) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        Self { path, cwd }
    }
}

impl Probe for PathProbe {
    fn find(&self, program: &str) -> Option<PathBuf> {
        which::which_in(program, Some(&self.path), &self.cwd).ok()
    }
}

/* ------------ 解析 ------------ */
pub struct ToolchainResolver {
    probe:      Arc<dyn Probe>,
    platform:   Platform,
    debug_info: bool,
}

impl ToolchainResolver {
    pub fn new(probe: Arc<dyn Probe>, platform: Platform, debug_info: bool) -> Self {
        Self { probe, platform, debug_info }
    }

    pub fn probe(&self) -> &dyn Probe { self.probe.as_ref() }

    pub fn resolve(&self, active: &SourceFile, files: &[SourceFile]) -> Result<Pipeline, ExecError> {
        let language = Language::from_file_name(&active.name)
            .ok_or_else(|| ExecError::Unsupported(active.name.clone()))?;
        let Some(desc) = ToolchainDescriptor::for_language(language, self.platform) else {
            return Ok(Pipeline::Preview);
        };

        let (name, path) = desc
            .candidates
            .iter()
            .find_map(|c| self.probe.find(c).map(|p| (*c, p)))
            .ok_or(ExecError::ToolchainNotFound { language: desc.missing, hint: desc.hint })?;
        tracing::debug!(language = desc.language.label(), tool = name, path = %path.display(), "toolchain resolved");

        match language {
            Language::Python | Language::JavaScript => Ok(Pipeline::Run(Runnable::Interpret {
                language,
                interpreter: path,
                entry: active.name.clone(),
            })),
            _ => Ok(self.compile_pipeline(language, name, path, active, files)),
        }
    }

    fn compile_pipeline(
        &self,
        language: Language,
        compiler: &'static str,
        path: PathBuf,
        active: &SourceFile,
        files: &[SourceFile],
    ) -> Pipeline {
        let family = CompilerFamily::of(compiler);
        let binary = match self.platform {
            Platform::Windows => "output.exe",
            Platform::Unix    => "output",
        };

        let mut sources: Vec<&str> = files
            .iter()
            .filter(|f| language.is_source(&f.name))
            .map(|f| f.name.as_str())
            .collect();
        if !sources.contains(&active.name.as_str()) {
            sources.insert(0, &active.name);
        }

        let mut build = CommandSpec::new(path);
        if family == CompilerFamily::Msvc {
            build = build.arg(format!("/Fe:{binary}")).arg(active.name.clone());
            sources = vec![active.name.as_str()];
        } else {
            let std_flag = if language == Language::Cpp { "-std=c++17" } else { "-std=c11" };
            for s in &sources {
                build = build.arg(*s);
            }
            build = build.arg(std_flag).arg("-o").arg(binary);
            if self.debug_info {
                build = build.arg("-g");
            }
            let needs = LibraryNeeds::scan(
                files
                    .iter()
                    .filter(|f| language.is_source(&f.name) || is_header(&f.name))
                    .map(|f| f.content.as_str()),
            );
            for flag in needs.link_flags(family, self.platform) {
                build = build.arg(flag);
            }
        }

        Pipeline::Run(Runnable::Compile {
            language,
            compiler,
            build,
            binary: binary.to_owned(),
            entry: active.name.clone(),
            sources: sources.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeProbe(HashMap<&'static str, PathBuf>);

    impl FakeProbe {
        fn with(tools: &[&'static str]) -> Arc<dyn Probe> {
            Arc::new(Self(tools.iter().map(|t| (*t, PathBuf::from(format!("/usr/bin/{t}")))).collect()))
        }
    }

    impl Probe for FakeProbe {
        fn find(&self, program: &str) -> Option<PathBuf> { self.0.get(program).cloned() }
    }

    fn src(name: &str, content: &str, active: bool) -> SourceFile {
        SourceFile { name: name.into(), content: content.into(), is_active: active }
    }

    fn resolve(tools: &[&'static str], platform: Platform, files: &[SourceFile]) -> Result<Pipeline, ExecError> {
        let active = files.iter().find(|f| f.is_active).unwrap();
        ToolchainResolver::new(FakeProbe::with(tools), platform, true).resolve(active, files)
    }

    #[test]
    fn maps_extensions() {
        assert_eq!(Language::from_file_name("a.py"), Some(Language::Python));
        assert_eq!(Language::from_file_name("dir/a.JS"), Some(Language::JavaScript));
        assert_eq!(Language::from_file_name("a.c"), Some(Language::C));
        assert_eq!(Language::from_file_name("a.cc"), Some(Language::Cpp));
        assert_eq!(Language::from_file_name("index.html"), Some(Language::Html));
        assert_eq!(Language::from_file_name("Makefile"), None);
        assert_eq!(Language::from_file_name("a.rb"), None);
    }

    #[test]
    fn python_probe_order_depends_on_platform() {
        let files = [src("main.py", "print(1)", true)];
        let unix = resolve(&["python", "python3"], Platform::Unix, &files).unwrap();
        let win = resolve(&["python", "python3"], Platform::Windows, &files).unwrap();
        assert!(matches!(unix, Pipeline::Run(Runnable::Interpret { interpreter, .. }) if interpreter.ends_with("python3")));
        assert!(matches!(win, Pipeline::Run(Runnable::Interpret { interpreter, .. }) if interpreter.ends_with("python")));
    }

    #[test]
    fn missing_python_is_toolchain_not_found() {
        let files = [src("main.py", "print(1)", true)];
        let err = resolve(&["gcc"], Platform::Unix, &files).unwrap_err();
        assert!(matches!(err, ExecError::ToolchainNotFound { language: "Python", .. }));
    }

    #[test]
    fn html_is_preview_only_even_without_tools() {
        let files = [src("index.html", "<p>", true)];
        assert_eq!(resolve(&[], Platform::Unix, &files).unwrap(), Pipeline::Preview);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let files = [src("main.rb", "puts 1", true)];
        assert!(matches!(resolve(&["ruby"], Platform::Unix, &files), Err(ExecError::Unsupported(n)) if n == "main.rb"));
    }

    #[test]
    fn cpp_prefers_gpp_and_compiles_all_sources() {
        let files = [
            src("main.cpp", "#include <cmath>\nint main(){return (int)sqrt(4.0);}", true),
            src("util.cc", "int two(){return 2;}", false),
            src("util.h", "#include <thread>", false),
            src("notes.txt", "socket bind listen", false),
        ];
        let Pipeline::Run(Runnable::Compile { compiler, build, sources, binary, .. }) =
            resolve(&["clang++", "g++"], Platform::Unix, &files).unwrap()
        else {
            panic!("expected compile pipeline")
        };
        assert_eq!(compiler, "g++");
        assert_eq!(sources, 2);
        assert_eq!(binary, "output");
        assert_eq!(
            build.args,
            vec!["main.cpp", "util.cc", "-std=c++17", "-o", "output", "-g", "-lm", "-pthread"]
        );
    }

    #[test]
    fn c_falls_back_to_clang() {
        let files = [src("a.c", "int main(){return 0;}", true)];
        let Pipeline::Run(Runnable::Compile { compiler, build, .. }) = resolve(&["clang"], Platform::Unix, &files).unwrap() else {
            panic!("expected compile pipeline")
        };
        assert_eq!(compiler, "clang");
        assert_eq!(build.args, vec!["a.c", "-std=c11", "-o", "output", "-g"]);
    }

    #[test]
    fn msvc_uses_its_own_output_syntax() {
        let files = [src("a.cpp", "#include <cmath>", true), src("b.cpp", "", false)];
        let Pipeline::Run(Runnable::Compile { compiler, build, binary, sources, .. }) =
            resolve(&["cl"], Platform::Windows, &files).unwrap()
        else {
            panic!("expected compile pipeline")
        };
        assert_eq!(compiler, "cl");
        assert_eq!(binary, "output.exe");
        assert_eq!(sources, 1);
        assert_eq!(build.args, vec!["/Fe:output.exe", "a.cpp"]);
    }

    #[test]
    fn cl_is_never_probed_off_windows() {
        let files = [src("a.c", "", true)];
        let err = resolve(&["cl"], Platform::Unix, &files).unwrap_err();
        assert!(matches!(err, ExecError::ToolchainNotFound { language: "A C compiler", .. }));
    }

    #[test]
    fn socket_flags_are_platform_specific() {
        let needs = LibraryNeeds::scan(["int s = socket(AF_INET, SOCK_STREAM, 0);"]);
        assert!(needs.sockets && !needs.math);
        assert_eq!(needs.link_flags(CompilerFamily::Gnu, Platform::Windows), vec!["-lws2_32"]);
        assert!(needs.link_flags(CompilerFamily::Msvc, Platform::Windows).is_empty());
    }

    #[test]
    fn release_builds_skip_debug_info() {
        let files = [src("a.c", "", true)];
        let p = ToolchainResolver::new(FakeProbe::with(&["gcc"]), Platform::Unix, false)
            .resolve(&files[0], &files)
            .unwrap();
        let Pipeline::Run(Runnable::Compile { build, .. }) = p else { panic!("expected compile pipeline") };
        assert!(!build.args.iter().any(|a| a == "-g"));
    }

    #[test]
    fn command_display_quotes_spaces() {
        let cmd = CommandSpec::new("/opt/my tools/gcc").arg("a.c").arg("-o").arg("out put");
        assert_eq!(cmd.to_string(), "\"/opt/my tools/gcc\" a.c -o \"out put\"");
    }
}
