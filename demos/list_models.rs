use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let repo = std::env::args().nth(1).map(PathBuf::from);
    let list = demix::list_models(repo.as_deref())?;

    println!("single models:");
    for name in &list.single {
        println!("  {}", name);
    }
    println!("bag models:");
    for name in &list.bag {
        println!("  {}", name);
    }
    Ok(())
}
