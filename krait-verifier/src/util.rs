//! Helpers shared by tests and embedders' test suites.

pub mod test_helpers {
    //! A small builder assembling verification runs.

    use krait_asm::Instruction;

    use crate::ctx::{
        ProgramKind,
        VerifierConfig,
    };
    use crate::error::VerifierError;
    use crate::ktype::KtypeDb;
    use crate::log::LogLevel;
    use crate::map::{
        MapDef,
        MapKind,
    };
    use crate::verifier::{
        verify_full,
        VerifiedProgram,
        VerifierInput,
    };

    /// Assembles a program, its maps, and a configuration, then runs the
    /// verifier.
    pub struct ProgramBuilder {
        insns: Vec<Instruction>,
        maps: Vec<MapDef>,
        ktypes: KtypeDb,
        kind: ProgramKind,
        config: VerifierConfig,
    }

    impl Default for ProgramBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProgramBuilder {
        /// Privileged socket-filter run, the common test shape.
        pub fn new() -> Self {
            let mut config = VerifierConfig::privileged();
            config.log_level = LogLevel::Info;
            Self {
                insns: Vec::new(),
                maps: Vec::new(),
                ktypes: KtypeDb::new(),
                kind: ProgramKind::SocketFilter,
                config,
            }
        }

        /// Append one instruction.
        pub fn insn(mut self, insn: Instruction) -> Self {
            self.insns.push(insn);
            self
        }

        /// Append a sequence (e.g. a 64-bit immediate load pair).
        pub fn insns(mut self, insns: impl IntoIterator<Item = Instruction>) -> Self {
            self.insns.extend(insns);
            self
        }

        /// Register a map; the return value is its descriptor.
        pub fn map(&mut self, map: MapDef) -> i32 {
            self.maps.push(map);
            self.maps.len() as i32 - 1
        }

        /// A hash map with the given key and value sizes; returns its
        /// descriptor.
        pub fn hash_map(&mut self, key_size: u32, value_size: u32) -> i32 {
            self.map(MapDef::plain("test_hash", MapKind::Hash, key_size, value_size))
        }

        /// Switch the program kind.
        pub fn kind(mut self, kind: ProgramKind) -> Self {
            self.kind = kind;
            self
        }

        /// Drop all privileges and hardening bypasses.
        pub fn unprivileged(mut self) -> Self {
            let level = self.config.log_level;
            self.config = VerifierConfig::default();
            self.config.log_level = level;
            self
        }

        /// Replace the configuration wholesale.
        pub fn config(mut self, config: VerifierConfig) -> Self {
            self.config = config;
            self
        }

        /// Mutable access to the type database for registering types.
        pub fn ktypes(&mut self) -> &mut KtypeDb {
            &mut self.ktypes
        }

        /// Run the verifier.
        pub fn run(self) -> Result<VerifiedProgram, VerifierError> {
            self.run_logged().0
        }

        /// Run the verifier, also returning the log.
        pub fn run_logged(self) -> (Result<VerifiedProgram, VerifierError>, String) {
            verify_full(VerifierInput {
                insns: self.insns,
                kind: self.kind,
                maps: self.maps,
                ktypes: &self.ktypes,
                config: self.config,
                line_info: Vec::new(),
            })
        }
    }
}
