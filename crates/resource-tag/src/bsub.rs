use crate::ResourceTag;

impl ResourceTag {
    /// Renders the tag as LSF `bsub` arguments.
    ///
    /// Memory is requested both as a per-process limit and as a host
    /// selection/reservation string so LSF places the job on a host that can
    /// hold it.
    pub fn bsub_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(minutes) = self.runtime_minutes {
            args.push("-W".to_string());
            args.push(minutes.to_string());
        }
        if let Some(cores) = self.cores {
            args.push("-n".to_string());
            args.push(cores.to_string());
        }
        if let Some(mem) = self.memory_mb {
            args.push("-M".to_string());
            args.push(format!("{}MB", mem));
            args.push("-R".to_string());
            args.push(format!("select[mem>{mem}] rusage[mem={mem}]"));
        }
        args
    }
}
