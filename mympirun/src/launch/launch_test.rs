use super::*;
use crate::{
    pmi::SLURM_UNSET_VARIABLES,
    testutil::{search_path, write_executable},
};
use std::{fs, path::PathBuf};

const FAKE_SRUN: &str = r#"if [ "$1" = "--mpi=list" ]; then
    echo "srun: MPI types are..."
    echo "srun: none"
    echo "srun: pmi2"
    echo "srun: pmix_v3"
    exit 0
fi
[ -n "$SLURM_NPROCS" ] && exit 10
[ -z "$SLURM_JOB_ID" ] && exit 11
exit 0"#;

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
pub fn user_command_is_the_trailing_suffix() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("custom").join("bin");
    let mpirun = write_executable(&bin, "mpirun", "exit 0");

    let mut ctx = RunContext::from_vars([("PATH", search_path(&[&bin]))]);
    let options = RunOptions {
        hybrid: Some(2),
        basepath: Some(root.path().to_path_buf()),
        mpirunoptions: args(&["--verbose"]),
        cmd: args(&["echo", "foo"]),
        ..RunOptions::default()
    };

    let cmd = make_mpirun(&mut ctx, &options, "mympirun").unwrap();
    let argv = cmd.build_command();

    assert_eq!(argv.first(), Some(&mpirun.to_string_lossy().into_owned()));
    assert_eq!(argv[1], "--verbose");
    assert_eq!(argv[argv.len() - 2..], ["echo", "foo"]);
    assert!(argv.windows(2).any(|pair| pair == ["-np", "2"]));

    let node_file = PathBuf::from(&cmd.mpiexec_options[1]);
    assert_eq!(fs::read_to_string(node_file).unwrap().lines().count(), 2);
    assert_eq!(ctx.var("HYDRA_BOOTSTRAP"), Some("fork"));
    assert!(ctx.contains("OMP_NUM_THREADS"));
}

#[test]
pub fn openmpi_gets_its_byte_transfer_layer() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("OpenMPI").join("4.1.1").join("bin");
    write_executable(&bin, "mpirun", "exit 0");

    let mut ctx = RunContext::from_vars([("PATH", search_path(&[&bin]))]);
    let options = RunOptions {
        socket: true,
        basepath: Some(root.path().to_path_buf()),
        cmd: args(&["./a.out"]),
        ..RunOptions::default()
    };

    let cmd = make_mpirun(&mut ctx, &options, "mympirun").unwrap();
    assert_eq!(cmd.mpiexec_options[0], "--hostfile");
    assert!(cmd
        .mpiexec_options
        .windows(3)
        .any(|options| options == ["--mca", "btl", "sm,tcp,self"]));
    assert!(cmd.mpdboot_options.is_empty());
}

#[test]
pub fn pmi_negotiation_clears_task_counts() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    let srun = write_executable(&bin, "srun", FAKE_SRUN);

    let mut ctx = RunContext::from_vars([
        ("PATH", search_path(&[&bin])),
        ("SLURM_JOB_ID", "4242".to_string()),
        ("SLURM_JOB_NODELIST", "node[01-02]".to_string()),
        ("SLURM_JOB_CPUS_PER_NODE", "4(x2)".to_string()),
        ("SLURM_NNODES", "2".to_string()),
        ("SLURM_NPROCS", "8".to_string()),
        ("SLURM_NTASKS", "8".to_string()),
    ]);
    assert!(ctx.contains("SLURM_NPROCS"));

    let options = RunOptions {
        cmd: args(&["hostname"]),
        ..RunOptions::default()
    };
    let cmd = make_pmirun(&mut ctx, &options, "mypmirun").unwrap();

    for name in SLURM_UNSET_VARIABLES {
        assert!(!ctx.contains(name), "{name} should be unset");
    }
    assert_eq!(ctx.var("SLURM_JOB_ID"), Some("4242"));
    assert_eq!(ctx.var("SLURM_JOB_NODELIST"), Some("node[01-02]"));

    assert_eq!(cmd.launcher, srun);
    assert!(cmd.mpiexec_options.contains(&"--mpi=pmix".to_string()));
    assert!(cmd.mpiexec_options.contains(&"--nodes=2".to_string()));
    assert!(cmd.mpiexec_options.contains(&"--ntasks=8".to_string()));
    assert_eq!(cmd.cmdargs, args(&["hostname"]));

    // the launched srun sees exactly the cleaned environment
    assert_eq!(command::execute(&cmd.build_command(), &ctx).unwrap(), 0);
}

#[test]
pub fn pmirun_harvests_the_environment() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    write_executable(&bin, "srun", FAKE_SRUN);

    let mut ctx = RunContext::from_vars([
        ("PATH", search_path(&[&bin])),
        ("SLURM_JOB_ID", "4243".to_string()),
        ("SLURM_JOB_NODELIST", "node[01-02]".to_string()),
        ("SLURM_NNODES", "2".to_string()),
        ("SLURM_NTASKS", "8".to_string()),
        ("MODULEPATH", "/apps/modules".to_string()),
        ("LOADEDMODULES", "foss/2023a".to_string()),
    ]);

    let options = RunOptions {
        noenvmodules: true,
        double: true,
        cmd: args(&["hostname"]),
        ..RunOptions::default()
    };
    let cmd = make_pmirun(&mut ctx, &options, "mypmirun").unwrap();

    assert_eq!(ctx.var("MKL_NUM_THREADS"), Some("1"));
    assert!(!ctx.contains("MODULEPATH"));
    assert!(!ctx.contains("LOADEDMODULES"));
    assert!(cmd.mpiexec_options.contains(&"--ntasks=16".to_string()));

    // module setup is passed on by default
    let mut ctx = RunContext::from_vars([
        ("PATH", search_path(&[&bin])),
        ("SLURM_JOB_ID", "4244".to_string()),
        ("SLURM_JOB_NODELIST", "node01".to_string()),
        ("MODULEPATH", "/apps/modules".to_string()),
    ]);
    let options = RunOptions {
        cmd: args(&["hostname"]),
        ..RunOptions::default()
    };
    make_pmirun(&mut ctx, &options, "mypmirun").unwrap();
    assert_eq!(ctx.var("MODULEPATH"), Some("/apps/modules"));
    assert_eq!(ctx.var("MKL_NUM_THREADS"), Some("1"));
}

#[test]
pub fn pmirun_requires_slurm() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    write_executable(&bin, "srun", FAKE_SRUN);

    let mut ctx = RunContext::from_vars([("PATH", search_path(&[&bin]))]);
    let options = RunOptions {
        setsched: Some("local".to_string()),
        cmd: args(&["hostname"]),
        ..RunOptions::default()
    };

    let error = make_pmirun(&mut ctx, &options, "mypmirun").unwrap_err();
    assert!(matches!(error, LaunchError::Pmi(PmiError::NotSlurm("local"))));
    assert_eq!(error.exit_code(), 6);
}

#[test]
pub fn dry_run_and_preflight() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    write_executable(&bin, "mpirun", "exit 9");

    let mut ctx = RunContext::from_vars([("PATH", search_path(&[&bin]))]);
    let options = RunOptions {
        dry_run: true,
        basepath: Some(root.path().to_path_buf()),
        cmd: args(&["true"]),
        ..RunOptions::default()
    };
    assert_eq!(run(&mut ctx, &options, "mympirun").unwrap(), 0);

    // without dry run the launcher status is passed on
    let options = RunOptions {
        dry_run: false,
        ..options
    };
    assert_eq!(run(&mut ctx, &options, "/usr/bin/mympirun").unwrap(), 9);

    let error = run(&mut ctx, &RunOptions::default(), "mympirun").unwrap_err();
    assert!(matches!(error, LaunchError::Config(ConfigErrors::Preflight)));
    assert_eq!(error.exit_code(), 2);
}

#[test]
pub fn missing_mpirun_exit_code() {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = RunContext::from_vars([("PATH", search_path(&[root.path()]))]);
    let options = RunOptions {
        cmd: args(&["true"]),
        ..RunOptions::default()
    };

    let error = run(&mut ctx, &options, "mympirun").unwrap_err();
    assert_eq!(error.exit_code(), 3);
}
