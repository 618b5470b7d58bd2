//! Interactive terminal client for the bank server.

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use std::io::{self, BufRead, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;

use ubank::client::{Client, ClientConfig, Semantics};
use ubank::proto::{Currency, Update};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1")]
    server: String,

    #[clap(long, default_value_t = 9000)]
    port: u16,

    #[clap(
        long,
        default_value = "atleast",
        help = "invocation semantics: atmost or atleast"
    )]
    sem: String,

    #[clap(
        long,
        default_value_t = 1000,
        help = "per-attempt reply timeout in milliseconds"
    )]
    timeout: u64,

    #[clap(long, default_value_t = 3, help = "send attempts before giving up")]
    retry: u32,
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_f64(label: &str) -> Result<f64> {
    let line = prompt(label)?;
    line.parse().map_err(|_| eyre!("'{line}' is not a number"))
}

fn prompt_i32(label: &str) -> Result<i32> {
    let line = prompt(label)?;
    line.parse()
        .map_err(|_| eyre!("'{line}' is not an account number"))
}

fn prompt_u16(label: &str) -> Result<u16> {
    let line = prompt(label)?;
    line.parse().map_err(|_| eyre!("'{line}' is not a count"))
}

fn prompt_currency() -> Result<Currency> {
    let line = prompt("Currency (CNY/SGD): ")?;
    match line.to_uppercase().as_str() {
        "CNY" | "0" => Ok(Currency::CNY),
        "SGD" | "1" => Ok(Currency::SGD),
        other => Err(eyre!("unknown currency '{other}'")),
    }
}

fn print_update(update: &Update) {
    println!(
        "[update] {:?}: account {} now {:.2} {:?} ({})",
        update.update_type, update.account_no, update.new_balance, update.currency, update.info
    );
}

const MENU: &str = "\
--- ubank ---
1) open account
2) close account
3) deposit
4) withdraw
5) query balance
6) transfer
7) monitor updates
q) quit";

/// Run one menu choice. Returns false when the user quits.
fn run_choice(client: &mut Client, choice: &str) -> Result<bool> {
    match choice {
        "1" => {
            let name = prompt("Name: ")?;
            let password = prompt("Password (1-16 chars): ")?;
            let currency = prompt_currency()?;
            let initial = prompt_f64("Initial balance: ")?;
            let reply = client.open(&name, &password, currency, initial)?;
            println!(
                "opened account {} with balance {:.2}",
                reply.account_no, reply.balance
            );
        }
        "2" => {
            let name = prompt("Name: ")?;
            let account_no = prompt_i32("Account number: ")?;
            let password = prompt("Password: ")?;
            let reply = client.close(&name, account_no, &password)?;
            println!("{}", reply.info);
        }
        "3" => {
            let name = prompt("Name: ")?;
            let account_no = prompt_i32("Account number: ")?;
            let password = prompt("Password: ")?;
            let currency = prompt_currency()?;
            let amount = prompt_f64("Amount: ")?;
            let reply = client.deposit(&name, account_no, &password, currency, amount)?;
            println!("new balance: {:.2}", reply.balance);
        }
        "4" => {
            let name = prompt("Name: ")?;
            let account_no = prompt_i32("Account number: ")?;
            let password = prompt("Password: ")?;
            let currency = prompt_currency()?;
            let amount = prompt_f64("Amount: ")?;
            let reply = client.withdraw(&name, account_no, &password, currency, amount)?;
            println!("new balance: {:.2}", reply.balance);
        }
        "5" => {
            let name = prompt("Name: ")?;
            let account_no = prompt_i32("Account number: ")?;
            let password = prompt("Password: ")?;
            let reply = client.query_balance(&name, account_no, &password)?;
            println!("balance: {:.2} {:?}", reply.balance, reply.currency);
        }
        "6" => {
            let name = prompt("Name: ")?;
            let from_account = prompt_i32("From account: ")?;
            let password = prompt("Password: ")?;
            let to_account = prompt_i32("To account: ")?;
            let currency = prompt_currency()?;
            let amount = prompt_f64("Amount: ")?;
            let reply = client.transfer(
                &name,
                from_account,
                &password,
                to_account,
                currency,
                amount,
            )?;
            println!(
                "transferred: {:.2} remaining, counterparty at {:.2}",
                reply.from_balance, reply.to_balance
            );
        }
        "7" => {
            let seconds = prompt_u16("Seconds to monitor: ")?;
            let reply = client.register_monitor(seconds)?;
            println!("{}", reply.info);
            client.watch_updates(seconds, |update| print_update(&update))?;
            println!("monitor window closed");
        }
        "q" | "Q" | "8" => return Ok(false),
        "" => {}
        other => println!("unknown choice '{other}'"),
    }
    Ok(true)
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let server = (args.server.as_str(), args.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| eyre!("could not resolve {}:{}", args.server, args.port))?;
    let config = ClientConfig {
        semantics: Semantics::parse(&args.sem),
        timeout: Duration::from_millis(args.timeout),
        retries: args.retry,
    };
    let mut client = Client::connect(server, config)?;
    println!(
        "connected to {server} ({:?} semantics)",
        config.semantics
    );

    loop {
        println!("{MENU}");
        let choice = prompt("> ")?;
        match run_choice(&mut client, choice.as_str()) {
            Ok(true) => {}
            Ok(false) => break,
            // operation and communication failures are receipts, not crashes
            Err(err) => println!("error: {err}"),
        }
    }
    Ok(())
}
